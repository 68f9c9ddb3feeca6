//! CFI (Canonical Fragment Identifier) module for EPUB
//!
//! Reading positions are stored as EPUB CFI strings. Unlike pixel or page
//! numbers, a CFI is a path through the book's logical document tree and
//! survives re-flow (font size, viewport changes).
//!
//! ```text
//! epubcfi(/6/4[chapter1]!/4/1:42)
//!         │  │          │ │ │ └── character offset 42
//!         │  │          │ │ └──── text node (odd = text)
//!         │  │          │ └────── body element
//!         │  │          └──────── indirection (into content doc)
//!         │  └─────────────────── spine item with ID assertion
//!         └────────────────────── spine element
//! ```

mod comparator;
mod generator;
mod parser;
mod types;

pub use generator::{section_text_cfi, CfiBuilder};
pub use parser::{parse, CfiParseError};
pub use types::{CharacterOffset, Cfi, CfiStep, StepKind, TextAssertion, SPINE_STEP};
