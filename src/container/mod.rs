//! EPUB content container
//!
//! Parses an EPUB package (zip + OPF) into the spine, table of contents and
//! metadata a session needs. Sections are served raw; layout belongs to the
//! rendering surface.

mod loader;
mod opf;
mod types;

use thiserror::Error;

pub use loader::{ContainerLoader, ContainerSource, ContentContainer};
pub use opf::resolve_href;
pub use types::{
    BookMetadata, BookStructure, Creator, ManifestItem, SectionContent, SpineSection, StepPath,
    TextMap, TextRun, TocEntry,
};

/// Why a package could not be opened
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Not a valid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Missing required part: {0}")]
    MissingPart(String),

    #[error("XML error in {part}: {message}")]
    Xml { part: String, message: String },

    #[error("Spine is empty")]
    EmptySpine,

    #[error("Spine references unknown manifest item: {0}")]
    UnknownSpineItem(String),

    #[error("Section index out of range: {0}")]
    SectionOutOfRange(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to fetch container: {0}")]
    Fetch(String),
}
