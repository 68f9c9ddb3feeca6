//! Parsed container types
//!
//! `BookStructure` is the structural version of a book: the spine in reading
//! order with per-section text weights, plus the table of contents. Addresses
//! are only meaningful against the structure they were produced for.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Descriptive metadata from the OPF
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookMetadata {
    pub title: String,
    pub creators: Vec<Creator>,
    pub language: Option<String>,
    pub identifier: Option<String>,
    pub publisher: Option<String>,
    pub description: Option<String>,
}

/// Creator (author) information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    pub name: String,
    pub role: Option<String>,
}

/// Manifest item from the OPF, href resolved to a full archive path
#[derive(Debug, Clone)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
}

/// One spine entry (reading order) with its text weight
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpineSection {
    pub index: usize,
    pub idref: String,
    /// Full path of the content document inside the archive
    pub href: String,
    pub media_type: String,
    pub linear: bool,
    /// Characters of body text, at least 1
    pub weight: u32,
}

/// Table of contents entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocEntry {
    pub label: String,
    /// Full archive path, including any `#fragment`
    pub href: String,
    /// Spine index the entry points into, when it resolves
    pub section_index: Option<usize>,
    pub children: Vec<TocEntry>,
}

/// Chapter content handed to the rendering surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionContent {
    pub index: usize,
    pub href: String,
    pub media_type: String,
    pub html: String,
}

/// Step path of the run inside its content document, as in the part of a
/// CFI after the indirection: `[4, 2, 1]` is `/4/2/1`
pub type StepPath = Vec<u32>;

/// One run of text between two child elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRun {
    pub path: StepPath,
    /// Characters of section text before this run
    pub start: u32,
    pub len: u32,
}

/// The text runs of one section in document order. Document order of runs is
/// also the CFI order of their paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextMap {
    runs: Vec<TextRun>,
}

impl TextMap {
    /// A section whose text is one run directly under `<body>`
    pub fn single_run(len: u32) -> Self {
        let mut map = Self::default();
        map.push(vec![4, 1], len);
        map
    }

    /// Append text at `path`; consecutive chunks under the same step merge
    pub fn push(&mut self, path: StepPath, len: u32) {
        if len == 0 {
            return;
        }
        let start = self.len();
        match self.runs.last_mut() {
            Some(last) if last.path == path => last.len = last.len.saturating_add(len),
            _ => self.runs.push(TextRun { path, start, len }),
        }
    }

    pub fn runs(&self) -> &[TextRun] {
        &self.runs
    }

    /// Total characters of text
    pub fn len(&self) -> u32 {
        self.runs
            .last()
            .map(|r| r.start.saturating_add(r.len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Characters of text before the point `path:offset`. Paths that name an
    /// element rather than a run sit before the first run inside it.
    pub fn offset_of(&self, path: &[u32], offset: u32) -> u32 {
        let mut before = 0;
        for run in &self.runs {
            match run.path.as_slice().cmp(path) {
                Ordering::Less => before = run.start.saturating_add(run.len),
                Ordering::Equal => return run.start.saturating_add(offset.min(run.len)),
                Ordering::Greater => break,
            }
        }
        before
    }

    /// Run holding the character at `offset`, and the offset inside it. The
    /// end of the text belongs to the last run.
    pub fn locate(&self, offset: u32) -> Option<(&[u32], u32)> {
        let run = self
            .runs
            .iter()
            .find(|r| offset < r.start.saturating_add(r.len))
            .or_else(|| self.runs.last())?;
        Some((&run.path, offset.saturating_sub(run.start).min(run.len)))
    }
}

/// Spine snapshot the locator maps addresses against
#[derive(Debug, Clone)]
pub struct BookStructure {
    version: String,
    sections: Vec<SpineSection>,
    text: Vec<TextMap>,
    toc: Vec<TocEntry>,
    /// Cumulative weight before each section
    starts: Vec<u64>,
    total_weight: u64,
}

impl BookStructure {
    /// Build a structure treating each section's text as a single run under `<body>`
    pub fn new(sections: Vec<SpineSection>, toc: Vec<TocEntry>) -> Self {
        Self::with_text(sections, toc, Vec::new())
    }

    /// Build a structure from sections and their text maps, in spine order.
    /// The version is derived from the spine and the text layout.
    pub fn with_text(sections: Vec<SpineSection>, toc: Vec<TocEntry>, mut text: Vec<TextMap>) -> Self {
        text.truncate(sections.len());
        for section in &sections[text.len()..] {
            text.push(TextMap::single_run(section.weight));
        }
        // Sections without text still occupy one unit
        for map in text.iter_mut().filter(|m| m.is_empty()) {
            *map = TextMap::single_run(1);
        }

        let mut starts = Vec::with_capacity(sections.len());
        let mut total_weight = 0u64;
        for section in &sections {
            starts.push(total_weight);
            total_weight += u64::from(section.weight.max(1));
        }

        let mut hasher = Sha256::new();
        for section in &sections {
            hasher.update(section.idref.as_bytes());
            hasher.update([0]);
            hasher.update(section.href.as_bytes());
            hasher.update([0]);
            hasher.update(section.weight.to_le_bytes());
        }
        for map in &text {
            for run in map.runs() {
                for step in &run.path {
                    hasher.update(step.to_le_bytes());
                }
                hasher.update(run.len.to_le_bytes());
            }
            hasher.update([0xff]);
        }
        let digest = hex::encode(hasher.finalize());

        Self {
            version: digest[..16].to_string(),
            sections,
            text,
            toc,
            starts,
            total_weight,
        }
    }

    /// Structural version; changes when the package is republished
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn sections(&self) -> &[SpineSection] {
        &self.sections
    }

    pub fn section(&self, index: usize) -> Option<&SpineSection> {
        self.sections.get(index)
    }

    pub fn table_of_contents(&self) -> &[TocEntry] {
        &self.toc
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Cumulative weight of all sections before `index`
    pub fn weight_before(&self, index: usize) -> Option<u64> {
        self.starts.get(index).copied()
    }

    /// Weight the locator assigns to a section (zero-weight sections count as 1)
    pub fn section_weight(&self, index: usize) -> Option<u64> {
        self.sections
            .get(index)
            .map(|s| u64::from(s.weight.max(1)))
    }

    /// Text runs of a section
    pub fn text_map(&self, index: usize) -> Option<&TextMap> {
        self.text.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(index: usize, idref: &str, weight: u32) -> SpineSection {
        SpineSection {
            index,
            idref: idref.to_string(),
            href: format!("OEBPS/{}.xhtml", idref),
            media_type: "application/xhtml+xml".to_string(),
            linear: true,
            weight,
        }
    }

    #[test]
    fn test_cumulative_weights() {
        let structure = BookStructure::new(
            vec![section(0, "a", 100), section(1, "b", 0), section(2, "c", 50)],
            Vec::new(),
        );

        // Zero-weight sections still occupy one unit
        assert_eq!(structure.total_weight(), 151);
        assert_eq!(structure.weight_before(0), Some(0));
        assert_eq!(structure.weight_before(1), Some(100));
        assert_eq!(structure.weight_before(2), Some(101));
        assert_eq!(structure.weight_before(3), None);
    }

    #[test]
    fn test_version_tracks_spine() {
        let a = BookStructure::new(vec![section(0, "a", 100)], Vec::new());
        let b = BookStructure::new(vec![section(0, "a", 100)], Vec::new());
        let c = BookStructure::new(vec![section(0, "a", 101)], Vec::new());

        assert_eq!(a.version(), b.version());
        assert_ne!(a.version(), c.version());
        assert_eq!(a.version().len(), 16);
    }

    #[test]
    fn test_text_map_offsets() {
        let mut map = TextMap::default();
        map.push(vec![4, 2, 1], 10);
        map.push(vec![4, 2, 1], 5);
        map.push(vec![4, 3], 0);
        map.push(vec![4, 4, 2, 1], 20);
        map.push(vec![4, 5], 7);

        assert_eq!(map.len(), 42);
        assert_eq!(map.runs().len(), 3);

        assert_eq!(map.offset_of(&[4, 2, 1], 12), 12);
        assert_eq!(map.offset_of(&[4, 2, 1], 99), 15);
        // Element paths land before their first run
        assert_eq!(map.offset_of(&[4, 4], 3), 15);
        assert_eq!(map.offset_of(&[4, 4, 2, 1], 3), 18);
        assert_eq!(map.offset_of(&[4, 40, 1], 0), 42);
        assert_eq!(map.offset_of(&[], 0), 0);

        assert_eq!(map.locate(0), Some((&[4, 2, 1][..], 0)));
        assert_eq!(map.locate(15), Some((&[4, 4, 2, 1][..], 0)));
        assert_eq!(map.locate(42), Some((&[4, 5][..], 7)));
        assert_eq!(TextMap::default().locate(0), None);
    }

    #[test]
    fn test_version_tracks_text_layout() {
        let flat = BookStructure::new(vec![section(0, "a", 10)], Vec::new());

        let mut nested = TextMap::default();
        nested.push(vec![4, 2, 1], 10);
        let structured =
            BookStructure::with_text(vec![section(0, "a", 10)], Vec::new(), vec![nested.clone()]);

        assert_ne!(flat.version(), structured.version());
        assert_eq!(structured.text_map(0), Some(&nested));
        assert_eq!(flat.text_map(0), Some(&TextMap::single_run(10)));
        assert_eq!(flat.text_map(1), None);
    }
}
