//! Package document parsing
//!
//! Parses `META-INF/container.xml`, the OPF package document, and the two TOC
//! formats (EPUB 3 navigation document, EPUB 2 NCX). Everything here works on
//! strings; archive access lives in the loader.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;

use super::types::{BookMetadata, Creator, ManifestItem, StepPath, TextMap, TocEntry};
use super::ContainerError;

/// Parsed OPF structure
#[derive(Debug)]
pub struct ParsedOpf {
    pub metadata: BookMetadata,
    /// Manifest items keyed by id, hrefs resolved against the OPF location
    pub manifest: HashMap<String, ManifestItem>,
    pub spine: Vec<SpineRef>,
    /// Manifest id of the NCX named by `<spine toc="...">`
    pub ncx_id: Option<String>,
}

/// An `<itemref>` in reading order
#[derive(Debug, Clone)]
pub struct SpineRef {
    pub idref: String,
    pub linear: bool,
}

fn xml_error(part: &str, err: impl std::fmt::Display) -> ContainerError {
    ContainerError::Xml {
        part: part.to_string(),
        message: err.to_string(),
    }
}

fn attribute(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Unescaped text, falling back to the raw bytes for HTML-only entities
fn text_of(t: &BytesText) -> String {
    match t.unescape() {
        Ok(text) => text.into_owned(),
        Err(_) => String::from_utf8_lossy(t).into_owned(),
    }
}

fn lenient_reader(content: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);
    reader.check_end_names(false);
    reader
}

/// Resolve an href relative to the document it appears in, producing a full
/// archive path. Percent-encoding is decoded; the fragment is preserved.
pub fn resolve_href(base_path: &str, href: &str) -> String {
    let (path, fragment) = match href.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (href, None),
    };

    let decoded = urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string());

    let joined = if decoded.is_empty() {
        base_path.to_string()
    } else if let Some(rooted) = decoded.strip_prefix('/') {
        rooted.to_string()
    } else {
        match base_path.rsplit_once('/') {
            Some((dir, _)) => format!("{}/{}", dir, decoded),
            None => decoded,
        }
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut resolved = segments.join("/");
    if let Some(fragment) = fragment {
        resolved.push('#');
        resolved.push_str(fragment);
    }
    resolved
}

/// Find the OPF path in `META-INF/container.xml`
pub fn parse_container_xml(content: &str) -> Result<String, ContainerError> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"rootfile" =>
            {
                if let Some(path) = attribute(&e, b"full-path").filter(|p| !p.is_empty()) {
                    return Ok(path);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error("META-INF/container.xml", e)),
            _ => {}
        }
    }

    Err(ContainerError::MissingPart(
        "rootfile in META-INF/container.xml".to_string(),
    ))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MetaField {
    Title,
    Creator,
    Language,
    Identifier,
    Publisher,
    Description,
}

impl MetaField {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(Self::Title),
            b"creator" => Some(Self::Creator),
            b"language" => Some(Self::Language),
            b"identifier" => Some(Self::Identifier),
            b"publisher" => Some(Self::Publisher),
            b"description" => Some(Self::Description),
            _ => None,
        }
    }
}

/// Parse an OPF package document located at `opf_path` in the archive
pub fn parse_opf(content: &str, opf_path: &str) -> Result<ParsedOpf, ContainerError> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut metadata = BookMetadata::default();
    let mut manifest = HashMap::new();
    let mut spine = Vec::new();
    let mut ncx_id = None;

    let mut in_metadata = false;
    let mut field: Option<(MetaField, String, Option<String>)> = None;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(opf_path, e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_start = matches!(event, Event::Start(_));
                match e.local_name().as_ref() {
                    b"metadata" if is_start => in_metadata = true,
                    b"item" => {
                        if let (Some(id), Some(href), Some(media_type)) = (
                            attribute(e, b"id"),
                            attribute(e, b"href"),
                            attribute(e, b"media-type"),
                        ) {
                            manifest.insert(
                                id.clone(),
                                ManifestItem {
                                    id,
                                    href: resolve_href(opf_path, &href),
                                    media_type,
                                    properties: attribute(e, b"properties"),
                                },
                            );
                        }
                    }
                    b"spine" => ncx_id = attribute(e, b"toc"),
                    b"itemref" => {
                        if let Some(idref) = attribute(e, b"idref") {
                            let linear = attribute(e, b"linear").as_deref() != Some("no");
                            spine.push(SpineRef { idref, linear });
                        }
                    }
                    name if in_metadata && is_start => {
                        if let Some(kind) = MetaField::from_name(name) {
                            field = Some((kind, String::new(), attribute(e, b"role")));
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) => {
                if let Some((_, ref mut text, _)) = field {
                    text.push_str(&text_of(t));
                }
            }
            Event::CData(ref c) => {
                if let Some((_, ref mut text, _)) = field {
                    text.push_str(&String::from_utf8_lossy(c));
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"metadata" => in_metadata = false,
                name => {
                    let closes_field =
                        matches!(&field, Some((kind, _, _)) if MetaField::from_name(name) == Some(*kind));
                    if closes_field {
                        if let Some((kind, text, role)) = field.take() {
                            apply_field(&mut metadata, kind, text.trim().to_string(), role);
                        }
                    }
                }
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(ParsedOpf {
        metadata,
        manifest,
        spine,
        ncx_id,
    })
}

fn apply_field(metadata: &mut BookMetadata, kind: MetaField, value: String, role: Option<String>) {
    if value.is_empty() {
        return;
    }
    match kind {
        MetaField::Title if metadata.title.is_empty() => metadata.title = value,
        MetaField::Creator => metadata.creators.push(Creator { name: value, role }),
        MetaField::Language => {
            metadata.language.get_or_insert(value);
        }
        MetaField::Identifier => {
            metadata.identifier.get_or_insert(value);
        }
        MetaField::Publisher => {
            metadata.publisher.get_or_insert(value);
        }
        MetaField::Description => {
            metadata.description.get_or_insert(value);
        }
        _ => {}
    }
}

fn empty_entry() -> TocEntry {
    TocEntry {
        label: String::new(),
        href: String::new(),
        section_index: None,
        children: Vec::new(),
    }
}

/// Attach a finished entry to its parent, or to the roots at top level
fn attach(stack: &mut [TocEntry], roots: &mut Vec<TocEntry>, entry: TocEntry) {
    if entry.label.is_empty() && entry.href.is_empty() && entry.children.is_empty() {
        return;
    }
    match stack.last_mut() {
        Some(parent) => parent.children.push(entry),
        None => roots.push(entry),
    }
}

/// Parse the `<nav epub:type="toc">` list of an EPUB 3 navigation document
pub fn parse_nav(content: &str, nav_path: &str) -> Result<Vec<TocEntry>, ContainerError> {
    let mut reader = lenient_reader(content);

    let mut in_toc = false;
    let mut stack: Vec<TocEntry> = Vec::new();
    let mut roots = Vec::new();
    let mut label: Option<(Vec<u8>, String)> = None;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(nav_path, e))?;
        match event {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"nav" if !in_toc => {
                    in_toc = attribute(e, b"type")
                        .map(|t| t.split_whitespace().any(|v| v == "toc"))
                        .unwrap_or(false);
                }
                b"li" if in_toc => stack.push(empty_entry()),
                name @ (b"a" | b"span") if in_toc && label.is_none() => {
                    if let (Some(top), Some(href)) = (stack.last_mut(), attribute(e, b"href")) {
                        top.href = resolve_href(nav_path, &href);
                    }
                    label = Some((name.to_vec(), String::new()));
                }
                _ => {}
            },
            Event::Text(ref t) => {
                if let Some((_, ref mut text)) = label {
                    text.push_str(&text_of(t));
                    text.push(' ');
                }
            }
            Event::End(ref e) if in_toc => match e.local_name().as_ref() {
                b"li" => {
                    if let Some(entry) = stack.pop() {
                        attach(&mut stack, &mut roots, entry);
                    }
                }
                b"nav" => break,
                name => {
                    if matches!(&label, Some((tag, _)) if tag.as_slice() == name) {
                        if let Some((_, text)) = label.take() {
                            if let Some(top) = stack.last_mut() {
                                top.label = collapse_whitespace(&text);
                            }
                        }
                    }
                }
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(roots)
}

/// Parse the `navMap` of an EPUB 2 NCX document
pub fn parse_ncx(content: &str, ncx_path: &str) -> Result<Vec<TocEntry>, ContainerError> {
    let mut reader = lenient_reader(content);

    let mut stack: Vec<TocEntry> = Vec::new();
    let mut roots = Vec::new();
    let mut label: Option<String> = None;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(ncx_path, e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => match e.local_name().as_ref() {
                b"navPoint" if matches!(event, Event::Start(_)) => stack.push(empty_entry()),
                b"text" if matches!(event, Event::Start(_)) => label = Some(String::new()),
                b"content" => {
                    if let (Some(top), Some(src)) = (stack.last_mut(), attribute(e, b"src")) {
                        if top.href.is_empty() {
                            top.href = resolve_href(ncx_path, &src);
                        }
                    }
                }
                _ => {}
            },
            Event::Text(ref t) => {
                if let Some(ref mut text) = label {
                    text.push_str(&text_of(t));
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"text" => {
                    if let (Some(text), Some(top)) = (label.take(), stack.last_mut()) {
                        if top.label.is_empty() {
                            top.label = collapse_whitespace(&text);
                        }
                    }
                }
                b"navPoint" => {
                    if let Some(entry) = stack.pop() {
                        attach(&mut stack, &mut roots, entry);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(roots)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Open element with the number of child elements seen so far
struct OpenElement {
    path: StepPath,
    children: u32,
}

fn child_element(stack: &mut [OpenElement]) -> StepPath {
    match stack.last_mut() {
        Some(parent) => {
            parent.children += 1;
            let mut path = parent.path.clone();
            path.push(parent.children * 2);
            path
        }
        // The root element is where CFI paths start
        None => Vec::new(),
    }
}

fn text_slot(stack: &[OpenElement]) -> Option<StepPath> {
    let parent = stack.last()?;
    let mut path = parent.path.clone();
    path.push(parent.children * 2 + 1);
    Some(path)
}

/// Map the body text of an XHTML document onto CFI step paths. Documents
/// without a `<body>` map all of their text. Malformed markup stops the walk
/// where parsing fails instead of failing the open.
pub fn text_map(content: &str) -> TextMap {
    let mut reader = lenient_reader(content);

    let mut stack: Vec<OpenElement> = Vec::new();
    let mut body_depth: Option<usize> = None;
    let mut saw_body = false;
    let mut all_text = TextMap::default();
    let mut body_text = TextMap::default();

    loop {
        let len = match reader.read_event() {
            Ok(Event::Start(e)) => {
                let path = child_element(&mut stack);
                if body_depth.is_none() && e.local_name().as_ref() == b"body" {
                    body_depth = Some(stack.len());
                    saw_body = true;
                }
                stack.push(OpenElement { path, children: 0 });
                continue;
            }
            Ok(Event::Empty(_)) => {
                child_element(&mut stack);
                continue;
            }
            Ok(Event::End(_)) => {
                stack.pop();
                if body_depth == Some(stack.len()) {
                    body_depth = None;
                }
                continue;
            }
            Ok(Event::Text(t)) => text_of(&t).chars().count() as u32,
            Ok(Event::CData(c)) => String::from_utf8_lossy(&c).chars().count() as u32,
            Ok(Event::Eof) | Err(_) => break,
            _ => continue,
        };

        if let Some(path) = text_slot(&stack) {
            if body_depth.is_some() {
                body_text.push(path.clone(), len);
            }
            all_text.push(path, len);
        }
    }

    if saw_body {
        body_text
    } else {
        all_text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
    <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
        <dc:title>Test Book</dc:title>
        <dc:creator opf:role="aut">Test Author</dc:creator>
        <dc:language>en</dc:language>
        <dc:identifier id="uid">urn:isbn:9780000000000</dc:identifier>
    </metadata>
    <manifest>
        <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
        <item id="ch1" href="text/chapter%201.xhtml" media-type="application/xhtml+xml"/>
        <item id="ch2" href="text/chapter2.xhtml" media-type="application/xhtml+xml"/>
        <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    </manifest>
    <spine toc="ncx">
        <itemref idref="ch1"/>
        <itemref idref="ch2" linear="no"/>
    </spine>
</package>"#;

    #[test]
    fn test_parse_container_xml() {
        let xml = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;
        assert_eq!(parse_container_xml(xml).unwrap(), "OEBPS/content.opf");

        let missing = r#"<container><rootfiles/></container>"#;
        assert!(matches!(
            parse_container_xml(missing),
            Err(ContainerError::MissingPart(_))
        ));
    }

    #[test]
    fn test_parse_opf() {
        let opf = parse_opf(OPF, "OEBPS/content.opf").unwrap();

        assert_eq!(opf.metadata.title, "Test Book");
        assert_eq!(opf.metadata.creators.len(), 1);
        assert_eq!(opf.metadata.creators[0].role.as_deref(), Some("aut"));
        assert_eq!(opf.metadata.language.as_deref(), Some("en"));
        assert_eq!(
            opf.metadata.identifier.as_deref(),
            Some("urn:isbn:9780000000000")
        );

        assert_eq!(opf.manifest["ch1"].href, "OEBPS/text/chapter 1.xhtml");
        assert_eq!(opf.manifest["nav"].properties.as_deref(), Some("nav"));
        assert_eq!(opf.spine.len(), 2);
        assert!(opf.spine[0].linear);
        assert!(!opf.spine[1].linear);
        assert_eq!(opf.ncx_id.as_deref(), Some("ncx"));
    }

    #[test]
    fn test_resolve_href() {
        assert_eq!(
            resolve_href("OEBPS/content.opf", "text/ch1.xhtml"),
            "OEBPS/text/ch1.xhtml"
        );
        assert_eq!(
            resolve_href("OEBPS/text/nav.xhtml", "../images/a.png"),
            "OEBPS/images/a.png"
        );
        assert_eq!(
            resolve_href("OEBPS/text/nav.xhtml", "ch2.xhtml#sec-1"),
            "OEBPS/text/ch2.xhtml#sec-1"
        );
        assert_eq!(resolve_href("content.opf", "ch1.xhtml"), "ch1.xhtml");
    }

    #[test]
    fn test_parse_nav() {
        let nav = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<body>
  <nav epub:type="landmarks"><ol><li><a href="cover.xhtml">Cover</a></li></ol></nav>
  <nav epub:type="toc">
    <ol>
      <li><a href="text/ch1.xhtml">Chapter <em>One</em></a>
        <ol>
          <li><a href="text/ch1.xhtml#s1">Section 1.1</a></li>
        </ol>
      </li>
      <li><a href="text/ch2.xhtml">Chapter Two</a></li>
    </ol>
  </nav>
</body>
</html>"#;

        let toc = parse_nav(nav, "OEBPS/nav.xhtml").unwrap();
        assert_eq!(toc.len(), 2);
        assert_eq!(toc[0].label, "Chapter One");
        assert_eq!(toc[0].href, "OEBPS/text/ch1.xhtml");
        assert_eq!(toc[0].children.len(), 1);
        assert_eq!(toc[0].children[0].href, "OEBPS/text/ch1.xhtml#s1");
        assert_eq!(toc[1].label, "Chapter Two");
    }

    #[test]
    fn test_parse_ncx() {
        let ncx = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
    <navPoint id="p1" playOrder="1">
      <navLabel><text>First</text></navLabel>
      <content src="text/ch1.xhtml"/>
      <navPoint id="p1a" playOrder="2">
        <navLabel><text>First, part A</text></navLabel>
        <content src="text/ch1.xhtml#a"/>
      </navPoint>
    </navPoint>
    <navPoint id="p2" playOrder="3">
      <navLabel><text>Second</text></navLabel>
      <content src="text/ch2.xhtml"/>
    </navPoint>
  </navMap>
</ncx>"#;

        let toc = parse_ncx(ncx, "OEBPS/toc.ncx").unwrap();
        assert_eq!(toc.len(), 2);
        assert_eq!(toc[0].label, "First");
        assert_eq!(toc[0].children[0].label, "First, part A");
        assert_eq!(toc[1].href, "OEBPS/text/ch2.xhtml");
    }

    #[test]
    fn test_text_map() {
        let xhtml = r#"<html><head><title>Ignored title</title></head>
<body><p>Hello</p><p>w&amp;rld&nbsp;!</p></body></html>"#;
        let map = text_map(xhtml);
        // "Hello" (5) + raw "w&amp;rld&nbsp;!" falls back to the raw text (16)
        assert_eq!(map.len(), 21);
        assert_eq!(map.runs()[0].path, vec![4, 2, 1]);
        assert_eq!(map.runs()[1].path, vec![4, 4, 1]);
        assert_eq!(map.runs()[1].start, 5);

        assert_eq!(text_map("<p>abc</p>").len(), 3);
        assert!(text_map("<html><body></body></html>").is_empty());
    }

    #[test]
    fn test_text_map_steps() {
        let xhtml = r#"<html><head/><body>
<h1>Title</h1>
intro<br/>more
<div><p>one</p><img src="a.png"/><p>two<em>three</em>four</p></div>
</body></html>"#;
        let paths: Vec<(Vec<u32>, u32, u32)> = text_map(xhtml)
            .runs()
            .iter()
            .map(|r| (r.path.clone(), r.start, r.len))
            .collect();

        assert_eq!(
            paths,
            vec![
                (vec![4, 2, 1], 0, 5),
                (vec![4, 3], 5, 5),
                (vec![4, 5], 10, 4),
                (vec![4, 6, 2, 1], 14, 3),
                (vec![4, 6, 6, 1], 17, 3),
                (vec![4, 6, 6, 2, 1], 20, 5),
                (vec![4, 6, 6, 3], 25, 4),
            ]
        );
    }
}
