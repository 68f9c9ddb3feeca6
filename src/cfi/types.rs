//! CFI (Canonical Fragment Identifier) types for reading positions
//!
//! A reading position is a single point in the book: a path of steps through the
//! package document into a content document, ending in an optional character offset.
//! Format: epubcfi(/6/4[chap01]!/4/1:268)
//!
//! Reference: <https://idpf.org/epub/linking/cfi/epub-cfi.html>

use std::fmt;

/// Step index of the `<spine>` element inside the package document
pub const SPINE_STEP: u32 = 6;

/// A point CFI addressing one reading location
#[derive(Debug, Clone)]
pub struct Cfi {
    /// Steps from the package document root
    pub steps: Vec<CfiStep>,
    /// Optional character offset at the end of the path
    pub offset: Option<CharacterOffset>,
}

/// A single step in a CFI path
#[derive(Debug, Clone)]
pub struct CfiStep {
    pub kind: StepKind,
    /// Optional ID assertion `[id]`
    pub assertion: Option<String>,
}

/// Type of CFI step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Element step with index (even = element, odd = text node)
    Element(u32),
    /// Indirection (`!`), steps into the referenced content document
    Indirection,
}

/// Character offset within the addressed text node
#[derive(Debug, Clone)]
pub struct CharacterOffset {
    pub offset: u32,
    pub assertion: Option<TextAssertion>,
}

/// Text around a location, used by renderers to re-anchor after edits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextAssertion {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

impl Cfi {
    pub fn new(steps: Vec<CfiStep>) -> Self {
        Self {
            steps,
            offset: None,
        }
    }

    /// The step selecting the spine item (`/6/N`), if this CFI starts at the spine
    pub fn spine_step(&self) -> Option<&CfiStep> {
        match self.steps.first()?.kind {
            StepKind::Element(SPINE_STEP) => {}
            _ => return None,
        }
        let step = self.steps.get(1)?;
        match step.kind {
            StepKind::Element(n) if n >= 2 && n % 2 == 0 => Some(step),
            _ => None,
        }
    }

    /// 0-based spine index. CFI numbers children 2, 4, 6...
    pub fn spine_index(&self) -> Option<usize> {
        match self.spine_step()?.kind {
            StepKind::Element(n) => Some((n / 2 - 1) as usize),
            StepKind::Indirection => None,
        }
    }

    /// ID assertion attached to the spine step, e.g. `chap01` in `/6/4[chap01]`
    pub fn spine_idref(&self) -> Option<&str> {
        self.spine_step()?.assertion.as_deref()
    }

    /// Terminal character offset, 0 when absent
    pub fn character_offset(&self) -> u32 {
        self.offset.as_ref().map(|o| o.offset).unwrap_or(0)
    }
}

impl CfiStep {
    pub fn element(index: u32) -> Self {
        Self {
            kind: StepKind::Element(index),
            assertion: None,
        }
    }

    pub fn element_with_id(index: u32, id: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Element(index),
            assertion: Some(id.into()),
        }
    }

    pub fn indirection() -> Self {
        Self {
            kind: StepKind::Indirection,
            assertion: None,
        }
    }
}

/// Escape the characters CFI reserves inside assertions
fn write_escaped(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    for ch in text.chars() {
        if matches!(ch, '^' | '[' | ']' | '(' | ')' | ',' | ';' | '=') {
            write!(f, "^")?;
        }
        write!(f, "{}", ch)?;
    }
    Ok(())
}

impl fmt::Display for Cfi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epubcfi(")?;
        for step in &self.steps {
            write!(f, "{}", step)?;
        }
        if let Some(ref offset) = self.offset {
            write!(f, ":{}", offset.offset)?;
            if let Some(ref assertion) = offset.assertion {
                write!(f, "{}", assertion)?;
            }
        }
        write!(f, ")")
    }
}

impl fmt::Display for CfiStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StepKind::Element(n) => write!(f, "/{}", n)?,
            StepKind::Indirection => write!(f, "!")?,
        }
        if let Some(ref id) = self.assertion {
            write!(f, "[")?;
            write_escaped(f, id)?;
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl fmt::Display for TextAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        if let Some(ref prefix) = self.prefix {
            write_escaped(f, prefix)?;
        }
        write!(f, ",")?;
        if let Some(ref suffix) = self.suffix {
            write_escaped(f, suffix)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_spine_assertion() {
        let cfi = Cfi::new(vec![
            CfiStep::element(6),
            CfiStep::element_with_id(4, "chapter1"),
            CfiStep::indirection(),
            CfiStep::element(4),
        ]);

        assert_eq!(cfi.to_string(), "epubcfi(/6/4[chapter1]!/4)");
    }

    #[test]
    fn test_spine_index_extraction() {
        let cfi = Cfi::new(vec![CfiStep::element(6), CfiStep::element(4)]);
        assert_eq!(cfi.spine_index(), Some(1));

        let cfi = Cfi::new(vec![CfiStep::element(6), CfiStep::element(2)]);
        assert_eq!(cfi.spine_index(), Some(0));

        // Not rooted at the spine
        let cfi = Cfi::new(vec![CfiStep::element(4), CfiStep::element(2)]);
        assert_eq!(cfi.spine_index(), None);

        // Odd steps address text nodes, never spine items
        let cfi = Cfi::new(vec![CfiStep::element(6), CfiStep::element(3)]);
        assert_eq!(cfi.spine_index(), None);
    }

    #[test]
    fn test_assertion_escaping() {
        let cfi = Cfi::new(vec![
            CfiStep::element(6),
            CfiStep::element_with_id(2, "a]b"),
        ]);
        assert_eq!(cfi.to_string(), "epubcfi(/6/2[a^]b])");
    }
}
