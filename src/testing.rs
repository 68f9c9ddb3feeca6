//! Shared test fixtures

use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::authority::server::{AuthorityError, ProgressLedger};
use crate::authority::{CheckpointUpload, RemoteAuthority, RemoteError, RemoteProgress};

struct Chapter {
    id: String,
    label: String,
    /// Text directly under `<body>` when there is one entry, else one `<p>` each
    paragraphs: Vec<usize>,
}

/// Builds small EPUB 3 packages in memory
pub struct EpubFixture {
    title: String,
    chapters: Vec<Chapter>,
    nav: bool,
    container_xml: bool,
    dangling_itemref: Option<String>,
}

impl EpubFixture {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            chapters: Vec::new(),
            nav: true,
            container_xml: true,
            dangling_itemref: None,
        }
    }

    /// Chapters of 100, 200 and 100 characters
    pub fn three_chapters() -> Self {
        Self::new("Three Chapters")
            .with_chapter("ch1", "Chapter 1", 100)
            .with_chapter("ch2", "Chapter 2", 200)
            .with_chapter("ch3", "Chapter 3", 100)
    }

    pub fn with_chapter(self, id: &str, label: &str, chars: usize) -> Self {
        self.with_paragraphs(id, label, &[chars])
    }

    /// Chapter made of `<p>` elements with the given character counts
    pub fn with_paragraphs(mut self, id: &str, label: &str, paragraphs: &[usize]) -> Self {
        self.chapters.push(Chapter {
            id: id.to_string(),
            label: label.to_string(),
            paragraphs: paragraphs.to_vec(),
        });
        self
    }

    pub fn without_nav(mut self) -> Self {
        self.nav = false;
        self
    }

    pub fn without_container_xml(mut self) -> Self {
        self.container_xml = false;
        self
    }

    pub fn with_dangling_itemref(mut self, idref: &str) -> Self {
        self.dangling_itemref = Some(idref.to_string());
        self
    }

    fn opf(&self) -> String {
        let mut manifest = String::new();
        let mut spine = String::new();

        if self.nav {
            manifest.push_str(
                r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>"#,
            );
        }
        for chapter in &self.chapters {
            manifest.push_str(&format!(
                r#"<item id="{0}" href="{0}.xhtml" media-type="application/xhtml+xml"/>"#,
                chapter.id
            ));
            spine.push_str(&format!(r#"<itemref idref="{}"/>"#, chapter.id));
        }
        if let Some(idref) = &self.dangling_itemref {
            spine.push_str(&format!(r#"<itemref idref="{}"/>"#, idref));
        }

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{}</dc:title>
    <dc:creator>Fixture Author</dc:creator>
    <dc:language>en</dc:language>
    <dc:identifier id="uid">urn:uuid:fixture</dc:identifier>
  </metadata>
  <manifest>{}</manifest>
  <spine>{}</spine>
</package>"#,
            self.title, manifest, spine
        )
    }

    fn nav_document(&self) -> String {
        let items: String = self
            .chapters
            .iter()
            .map(|c| format!(r#"<li><a href="{}.xhtml">{}</a></li>"#, c.id, c.label))
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>Contents</title></head>
<body><nav epub:type="toc"><ol>{}</ol></nav></body>
</html>"#,
            items
        )
    }

    fn chapter_document(chapter: &Chapter) -> String {
        let body = match chapter.paragraphs.as_slice() {
            [chars] => "x".repeat(*chars),
            paragraphs => paragraphs
                .iter()
                .map(|&chars| format!("<p>{}</p>", "x".repeat(chars)))
                .collect(),
        };
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>{}</title></head>
<body>{}</body>
</html>"#,
            chapter.label, body
        )
    }

    pub fn build(&self) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated = SimpleFileOptions::default();

        zip.start_file("mimetype", stored).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();

        if self.container_xml {
            zip.start_file("META-INF/container.xml", deflated).unwrap();
            zip.write_all(
                br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
            )
            .unwrap();
        }

        zip.start_file("OEBPS/content.opf", deflated).unwrap();
        zip.write_all(self.opf().as_bytes()).unwrap();

        if self.nav {
            zip.start_file("OEBPS/nav.xhtml", deflated).unwrap();
            zip.write_all(self.nav_document().as_bytes()).unwrap();
        }

        for chapter in &self.chapters {
            zip.start_file(format!("OEBPS/{}.xhtml", chapter.id), deflated)
                .unwrap();
            zip.write_all(Self::chapter_document(chapter).as_bytes())
                .unwrap();
        }

        zip.finish().unwrap().into_inner()
    }
}

/// Authority backed by a `ProgressLedger` with scriptable failures
pub struct ScriptedAuthority {
    ledger: ProgressLedger,
    failures: Mutex<VecDeque<RemoteError>>,
    offline: AtomicBool,
    lose_ack: AtomicBool,
    pushes: AtomicUsize,
    fetches: AtomicUsize,
}

impl ScriptedAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ledger: ProgressLedger::new(),
            failures: Mutex::new(VecDeque::new()),
            offline: AtomicBool::new(false),
            lose_ack: AtomicBool::new(false),
            pushes: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn ledger(&self) -> &ProgressLedger {
        &self.ledger
    }

    /// Fail the next request with `err`
    pub fn fail_next(&self, err: RemoteError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Apply the next push but report a transient failure
    pub fn lose_next_ack(&self) {
        self.lose_ack.store(true, Ordering::SeqCst);
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self) -> Option<RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Some(RemoteError::Transient("offline".to_string()));
        }
        self.failures.lock().unwrap().pop_front()
    }
}

fn remote_error(err: AuthorityError) -> RemoteError {
    match err {
        AuthorityError::Forbidden(m) => RemoteError::Rejected(m),
        other => RemoteError::Transient(other.to_string()),
    }
}

#[async_trait]
impl RemoteAuthority for ScriptedAuthority {
    async fn fetch_position(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<RemoteProgress>, RemoteError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        match self.ledger.get(user_id, book_id).await {
            Ok(progress) => Ok(Some(progress)),
            Err(AuthorityError::NotFound(_)) => Ok(None),
            Err(e) => Err(remote_error(e)),
        }
    }

    async fn push_checkpoint(
        &self,
        user_id: &str,
        book_id: &str,
        upload: &CheckpointUpload,
    ) -> Result<RemoteProgress, RemoteError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        let progress = self
            .ledger
            .apply(user_id, book_id, upload)
            .await
            .map_err(remote_error)?;
        if self.lose_ack.swap(false, Ordering::SeqCst) {
            return Err(RemoteError::Transient("connection reset".to_string()));
        }
        Ok(progress)
    }
}
