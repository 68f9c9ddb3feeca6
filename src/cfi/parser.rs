//! CFI Parser
//!
//! Parses EPUB CFI strings into point `Cfi` values.
//!
//! Grammar (subset used for reading positions):
//! ```text
//! cfi       = "epubcfi(" path ["," path "," path] ")"
//! path      = step* [offset]
//! step      = "/" number [assertion] | "!" [assertion]
//! offset    = ":" number [assertion]
//! assertion = "[" text ("," text)? (";" param)* "]"
//! ```
//!
//! A range CFI collapses to its start point.

use thiserror::Error;

use super::types::*;

/// CFI parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CfiParseError {
    #[error("Empty CFI string")]
    Empty,

    #[error("CFI must start with 'epubcfi('")]
    MissingPrefix,

    #[error("CFI must end with ')'")]
    MissingClosingParen,

    #[error("CFI has no steps")]
    NoSteps,

    #[error("Expected number at position {0}")]
    ExpectedNumber(usize),

    #[error("Unclosed bracket at position {0}")]
    UnclosedBracket(usize),

    #[error("Unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_if(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), CfiParseError> {
        if self.skip_if(expected) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn unexpected(&self) -> CfiParseError {
        CfiParseError::UnexpectedChar(self.peek().unwrap_or('\0'), self.pos)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn parse_number(&mut self) -> Result<u32, CfiParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(ch) if ch.is_ascii_digit()) {
            self.advance();
        }

        if self.pos == start {
            return Err(CfiParseError::ExpectedNumber(start));
        }

        self.input[start..self.pos]
            .parse()
            .map_err(|_| CfiParseError::ExpectedNumber(start))
    }

    /// Parse `[...]` into its comma-separated parts, dropping `;key=value` parameters.
    /// Returns `None` when no bracket follows.
    fn parse_assertion(&mut self) -> Result<Option<Vec<String>>, CfiParseError> {
        let start = self.pos;
        if !self.skip_if('[') {
            return Ok(None);
        }

        let mut parts = vec![String::new()];
        let mut in_params = false;

        loop {
            let Some(ch) = self.advance() else {
                return Err(CfiParseError::UnclosedBracket(start));
            };
            match ch {
                '^' => {
                    let escaped = self
                        .advance()
                        .ok_or(CfiParseError::UnclosedBracket(start))?;
                    if !in_params {
                        if let Some(last) = parts.last_mut() {
                            last.push(escaped);
                        }
                    }
                }
                ']' => break,
                '[' => return Err(CfiParseError::UnexpectedChar('[', self.pos - 1)),
                ';' => in_params = true,
                ',' if !in_params => parts.push(String::new()),
                _ if in_params => {}
                _ => {
                    if let Some(last) = parts.last_mut() {
                        last.push(ch);
                    }
                }
            }
        }

        Ok(Some(parts))
    }

    fn parse_step(&mut self) -> Result<CfiStep, CfiParseError> {
        let kind = if self.skip_if('/') {
            StepKind::Element(self.parse_number()?)
        } else if self.skip_if('!') {
            StepKind::Indirection
        } else {
            return Err(self.unexpected());
        };

        let assertion = self
            .parse_assertion()?
            .and_then(|parts| parts.into_iter().next())
            .filter(|id| !id.is_empty());

        Ok(CfiStep { kind, assertion })
    }

    fn parse_path(&mut self) -> Result<(Vec<CfiStep>, Option<CharacterOffset>), CfiParseError> {
        let mut steps = Vec::new();
        while matches!(self.peek(), Some('/') | Some('!')) {
            steps.push(self.parse_step()?);
        }

        let offset = if self.skip_if(':') {
            let offset = self.parse_number()?;
            let assertion = self.parse_assertion()?.map(|parts| {
                let mut parts = parts.into_iter().map(|p| Some(p).filter(|s| !s.is_empty()));
                TextAssertion {
                    prefix: parts.next().flatten(),
                    suffix: parts.next().flatten(),
                }
            });
            Some(CharacterOffset { offset, assertion })
        } else {
            None
        };

        Ok((steps, offset))
    }

    fn parse_cfi(&mut self) -> Result<Cfi, CfiParseError> {
        if !self.input.starts_with("epubcfi(") {
            return Err(CfiParseError::MissingPrefix);
        }
        self.pos = "epubcfi(".len();

        let (mut steps, mut offset) = self.parse_path()?;

        // Range: keep the common parent plus the start path
        if self.skip_if(',') {
            if offset.is_some() {
                return Err(self.unexpected());
            }
            let (start_steps, start_offset) = self.parse_path()?;
            self.expect(',')?;
            self.parse_path()?;
            steps.extend(start_steps);
            offset = start_offset;
        }

        if !self.skip_if(')') {
            return Err(CfiParseError::MissingClosingParen);
        }

        if steps.is_empty() {
            return Err(CfiParseError::NoSteps);
        }

        Ok(Cfi { steps, offset })
    }
}

/// Parse a CFI string into a point `Cfi`
pub fn parse(input: &str) -> Result<Cfi, CfiParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CfiParseError::Empty);
    }

    let mut parser = Parser::new(input);
    let cfi = parser.parse_cfi()?;

    if !parser.at_end() {
        return Err(parser.unexpected());
    }

    Ok(cfi)
}
