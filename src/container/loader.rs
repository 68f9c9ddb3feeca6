//! Content container loader
//!
//! Opens an EPUB package from bytes, a locally cached file, or a URL, and parses
//! it into a `BookStructure` plus metadata. Section content is read back out of
//! the in-memory archive on demand; nothing here renders.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;

use zip::ZipArchive;

use super::opf::{self, ParsedOpf};
use super::types::{
    BookMetadata, BookStructure, ManifestItem, SectionContent, SpineSection, TocEntry,
};
use super::ContainerError;

const CONTAINER_XML: &str = "META-INF/container.xml";

/// Where a package comes from. Sessions behave the same for every variant.
#[derive(Debug, Clone)]
pub enum ContainerSource {
    Bytes(Vec<u8>),
    /// Locally cached download
    Path(PathBuf),
    Url(String),
}

/// Loads packages into `ContentContainer`s
#[derive(Clone, Default)]
pub struct ContainerLoader {
    client: reqwest::Client,
}

impl ContainerLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetch and parse a package
    #[tracing::instrument(level = "debug", skip(self, source))]
    pub async fn open(&self, source: ContainerSource) -> Result<ContentContainer, ContainerError> {
        let bytes = match source {
            ContainerSource::Bytes(bytes) => bytes,
            ContainerSource::Path(path) => tokio::fs::read(&path).await?,
            ContainerSource::Url(url) => {
                tracing::debug!(%url, "fetching container");
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| ContainerError::Fetch(e.to_string()))?;
                response
                    .bytes()
                    .await
                    .map_err(|e| ContainerError::Fetch(e.to_string()))?
                    .to_vec()
            }
        };

        tokio::task::spawn_blocking(move || ContentContainer::from_bytes(bytes))
            .await
            .map_err(|e| ContainerError::Fetch(format!("parse task failed: {}", e)))?
    }
}

/// A parsed package: structure, metadata, and the archive for section reads
#[derive(Clone)]
pub struct ContentContainer {
    archive: Arc<Vec<u8>>,
    structure: BookStructure,
    metadata: BookMetadata,
}

impl std::fmt::Debug for ContentContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentContainer")
            .field("title", &self.metadata.title)
            .field("version", &self.structure.version())
            .field("sections", &self.structure.sections().len())
            .finish()
    }
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<String, ContainerError> {
    let mut file = archive
        .by_name(name)
        .map_err(|_| ContainerError::MissingPart(name.to_string()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl ContentContainer {
    /// Parse a package held in memory
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ContainerError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes.as_slice()))?;

        let opf_path = opf::parse_container_xml(&read_entry(&mut archive, CONTAINER_XML)?)?;
        let opf_content = read_entry(&mut archive, &opf_path)?;
        let ParsedOpf {
            metadata,
            manifest,
            spine,
            ncx_id,
        } = opf::parse_opf(&opf_content, &opf_path)?;

        if spine.is_empty() {
            return Err(ContainerError::EmptySpine);
        }

        let mut sections = Vec::with_capacity(spine.len());
        let mut text = Vec::with_capacity(spine.len());
        for (index, itemref) in spine.iter().enumerate() {
            let item = manifest
                .get(&itemref.idref)
                .ok_or_else(|| ContainerError::UnknownSpineItem(itemref.idref.clone()))?;
            let content = read_entry(&mut archive, &item.href)?;
            let map = opf::text_map(&content);
            sections.push(SpineSection {
                index,
                idref: item.id.clone(),
                href: item.href.clone(),
                media_type: item.media_type.clone(),
                linear: itemref.linear,
                weight: map.len().max(1),
            });
            text.push(map);
        }

        let mut toc = Self::read_toc(&mut archive, &manifest, ncx_id.as_deref());
        if toc.is_empty() {
            toc = toc_from_spine(&sections);
        }
        link_sections(&mut toc, &sections);

        let structure = BookStructure::with_text(sections, toc, text);
        tracing::debug!(
            title = %metadata.title,
            version = %structure.version(),
            sections = structure.sections().len(),
            "parsed container"
        );

        drop(archive);
        Ok(Self {
            archive: Arc::new(bytes),
            structure,
            metadata,
        })
    }

    /// TOC from the EPUB 3 nav document, else the NCX. A broken TOC document
    /// is not fatal: the caller falls back to the spine.
    fn read_toc<R: Read + std::io::Seek>(
        archive: &mut ZipArchive<R>,
        manifest: &HashMap<String, ManifestItem>,
        ncx_id: Option<&str>,
    ) -> Vec<TocEntry> {
        let nav = manifest.values().find(|item| {
            item.properties
                .as_deref()
                .map(|p| p.split_whitespace().any(|v| v == "nav"))
                .unwrap_or(false)
        });

        if let Some(nav) = nav {
            match read_entry(archive, &nav.href).and_then(|c| opf::parse_nav(&c, &nav.href)) {
                Ok(toc) if !toc.is_empty() => return toc,
                Ok(_) => {}
                Err(e) => tracing::warn!(href = %nav.href, "unreadable nav document: {}", e),
            }
        }

        if let Some(ncx) = ncx_id.and_then(|id| manifest.get(id)) {
            match read_entry(archive, &ncx.href).and_then(|c| opf::parse_ncx(&c, &ncx.href)) {
                Ok(toc) => return toc,
                Err(e) => tracing::warn!(href = %ncx.href, "unreadable NCX: {}", e),
            }
        }

        Vec::new()
    }

    pub fn structure(&self) -> &BookStructure {
        &self.structure
    }

    pub fn metadata(&self) -> &BookMetadata {
        &self.metadata
    }

    /// Raw content of a spine section for the rendering surface
    pub fn section(&self, index: usize) -> Result<SectionContent, ContainerError> {
        let section = self
            .structure
            .section(index)
            .ok_or(ContainerError::SectionOutOfRange(index))?;

        let mut archive = ZipArchive::new(Cursor::new(self.archive.as_slice()))?;
        let html = read_entry(&mut archive, &section.href)?;

        Ok(SectionContent {
            index,
            href: section.href.clone(),
            media_type: section.media_type.clone(),
            html,
        })
    }
}

fn toc_from_spine(sections: &[SpineSection]) -> Vec<TocEntry> {
    sections
        .iter()
        .filter(|s| s.linear)
        .map(|s| TocEntry {
            label: format!("Section {}", s.index + 1),
            href: s.href.clone(),
            section_index: Some(s.index),
            children: Vec::new(),
        })
        .collect()
}

fn link_sections(entries: &mut [TocEntry], sections: &[SpineSection]) {
    for entry in entries {
        let path = entry.href.split('#').next().unwrap_or(&entry.href);
        entry.section_index = sections.iter().position(|s| s.href == path);
        link_sections(&mut entry.children, sections);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::EpubFixture;

    #[test]
    fn test_open_fixture() {
        let container = ContentContainer::from_bytes(EpubFixture::three_chapters().build()).unwrap();

        assert_eq!(container.metadata().title, "Three Chapters");
        assert_eq!(container.metadata().language.as_deref(), Some("en"));

        let structure = container.structure();
        assert_eq!(structure.sections().len(), 3);
        assert_eq!(structure.sections()[0].href, "OEBPS/ch1.xhtml");
        assert_eq!(structure.sections()[0].weight, 100);
        assert_eq!(structure.sections()[1].weight, 200);
        assert_eq!(structure.total_weight(), 400);

        let toc = structure.table_of_contents();
        assert_eq!(toc.len(), 3);
        assert_eq!(toc[1].label, "Chapter 2");
        assert_eq!(toc[1].section_index, Some(1));

        let text = structure.text_map(1).unwrap();
        assert_eq!(text.runs().len(), 1);
        assert_eq!(text.runs()[0].path, vec![4, 1]);
    }

    #[test]
    fn test_paragraph_text_is_mapped() {
        let bytes = EpubFixture::new("Paragraphs")
            .with_paragraphs("ch1", "Chapter 1", &[30, 70])
            .build();
        let container = ContentContainer::from_bytes(bytes).unwrap();

        let structure = container.structure();
        assert_eq!(structure.sections()[0].weight, 100);
        let runs = structure.text_map(0).unwrap().runs();
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[1].path.as_slice(), runs[1].start), (&[4, 4, 1][..], 30));
    }

    #[test]
    fn test_section_content() {
        let container = ContentContainer::from_bytes(EpubFixture::three_chapters().build()).unwrap();

        let section = container.section(2).unwrap();
        assert_eq!(section.href, "OEBPS/ch3.xhtml");
        assert!(section.html.contains("<body>"));

        assert!(matches!(
            container.section(3),
            Err(ContainerError::SectionOutOfRange(3))
        ));
    }

    #[test]
    fn test_toc_falls_back_to_spine() {
        let bytes = EpubFixture::three_chapters().without_nav().build();
        let container = ContentContainer::from_bytes(bytes).unwrap();

        let toc = container.structure().table_of_contents();
        assert_eq!(toc.len(), 3);
        assert_eq!(toc[0].label, "Section 1");
    }

    #[test]
    fn test_malformed_containers() {
        assert!(matches!(
            ContentContainer::from_bytes(b"not a zip".to_vec()),
            Err(ContainerError::Archive(_))
        ));

        let bytes = EpubFixture::three_chapters().without_container_xml().build();
        assert!(matches!(
            ContentContainer::from_bytes(bytes),
            Err(ContainerError::MissingPart(part)) if part == CONTAINER_XML
        ));

        let bytes = EpubFixture::new("Empty").build();
        assert!(matches!(
            ContentContainer::from_bytes(bytes),
            Err(ContainerError::EmptySpine)
        ));

        let bytes = EpubFixture::three_chapters().with_dangling_itemref("ghost").build();
        assert!(matches!(
            ContentContainer::from_bytes(bytes),
            Err(ContainerError::UnknownSpineItem(id)) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_loader_reads_cached_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        std::fs::write(&path, EpubFixture::three_chapters().build()).unwrap();

        let loader = ContainerLoader::new();
        let from_path = loader.open(ContainerSource::Path(path)).await.unwrap();
        let from_bytes = loader
            .open(ContainerSource::Bytes(EpubFixture::three_chapters().build()))
            .await
            .unwrap();

        assert_eq!(
            from_path.structure().version(),
            from_bytes.structure().version()
        );
    }
}
