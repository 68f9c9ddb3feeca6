//! CFI Generator
//!
//! Builds point CFIs for spine items and positions inside their text.

use super::types::*;

/// Element step index of `<body>` inside an XHTML document (`<head>` is /2)
const BODY_STEP: u32 = 4;

/// Builder for constructing CFIs programmatically
#[derive(Debug, Clone, Default)]
pub struct CfiBuilder {
    steps: Vec<CfiStep>,
    offset: Option<CharacterOffset>,
}

impl CfiBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step to the spine element of the package document (`/6`)
    pub fn package_step(mut self) -> Self {
        self.steps.push(CfiStep::element(SPINE_STEP));
        self
    }

    /// Add a spine item step, asserting its idref.
    /// CFI uses 1-based even numbering: index 0 -> /2, index 1 -> /4.
    pub fn spine_item(mut self, index: usize, idref: &str) -> Self {
        let step = even_step(index);
        self.steps.push(if idref.is_empty() {
            CfiStep::element(step)
        } else {
            CfiStep::element_with_id(step, idref)
        });
        self
    }

    pub fn indirection(mut self) -> Self {
        self.steps.push(CfiStep::indirection());
        self
    }

    /// Add raw steps inside a content document. Even steps are elements,
    /// odd steps are the text between them.
    pub fn path(mut self, steps: &[u32]) -> Self {
        self.steps.extend(steps.iter().map(|&n| CfiStep::element(n)));
        self
    }

    pub fn character_offset(mut self, offset: u32) -> Self {
        self.offset = Some(CharacterOffset {
            offset,
            assertion: None,
        });
        self
    }

    pub fn build(self) -> Cfi {
        Cfi {
            steps: self.steps,
            offset: self.offset,
        }
    }
}

fn even_step(index: usize) -> u32 {
    ((index + 1) * 2) as u32
}

/// CFI for a character offset into a text run of a spine item:
/// `epubcfi(/6/N[idref]!<path>:offset)`. An empty path points at the first
/// text directly under `<body>`.
pub fn section_text_cfi(spine_index: usize, idref: &str, path: &[u32], char_offset: u32) -> Cfi {
    let path = if path.is_empty() { &[BODY_STEP, 1][..] } else { path };
    CfiBuilder::new()
        .package_step()
        .spine_item(spine_index, idref)
        .indirection()
        .path(path)
        .character_offset(char_offset)
        .build()
}
