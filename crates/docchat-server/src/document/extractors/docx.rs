use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::{Cursor, Read};
use tracing::debug;

use crate::document::error::ExtractError;
use crate::document::types::{
    DocxFields, DocxProperties, Extraction, ExtractionNote, SourceKind, StructuredFields,
};

use super::Extractor;

const DOCUMENT_XML: &str = "word/document.xml";
const CORE_XML: &str = "docProps/core.xml";

#[derive(Debug)]
enum Block {
    Paragraph { text: String, heading: bool },
    Table(Vec<Vec<String>>),
}

/// Walks `word/document.xml` keeping paragraphs and tables in document order
#[derive(Default)]
struct BodyWalker {
    blocks: Vec<Block>,
    table_depth: usize,
    table: Vec<Vec<String>>,
    row: Vec<String>,
    cell: String,
    paragraph: String,
    heading: bool,
    in_text_run: bool,
}

impl BodyWalker {
    fn start(&mut self, e: &BytesStart<'_>) {
        match e.local_name().as_ref() {
            b"tbl" => {
                self.table_depth += 1;
                if self.table_depth == 1 {
                    self.table.clear();
                }
            }
            b"tr" if self.table_depth == 1 => self.row.clear(),
            b"tc" if self.table_depth == 1 => self.cell.clear(),
            b"p" => {
                self.paragraph.clear();
                self.heading = false;
            }
            b"t" => self.in_text_run = true,
            b"pStyle" => self.style(e),
            _ => {}
        }
    }

    fn empty(&mut self, e: &BytesStart<'_>) {
        match e.local_name().as_ref() {
            b"tab" => self.paragraph.push('\t'),
            b"br" | b"cr" => self.paragraph.push('\n'),
            b"pStyle" => self.style(e),
            _ => {}
        }
    }

    fn style(&mut self, e: &BytesStart<'_>) {
        let is_heading = e
            .attributes()
            .flatten()
            .filter(|attr| attr.key.local_name().as_ref() == b"val")
            .filter_map(|attr| attr.unescape_value().ok())
            .any(|val| {
                let val = val.to_ascii_lowercase();
                val.starts_with("heading") || val == "title"
            });
        if is_heading {
            self.heading = true;
        }
    }

    fn end(&mut self, local_name: &[u8]) {
        match local_name {
            b"t" => self.in_text_run = false,
            b"p" => {
                let text = self.paragraph.trim().to_string();
                if self.table_depth > 0 {
                    if !text.is_empty() {
                        if !self.cell.is_empty() {
                            self.cell.push(' ');
                        }
                        self.cell.push_str(&text);
                    }
                } else if !text.is_empty() {
                    self.blocks.push(Block::Paragraph {
                        text,
                        heading: self.heading,
                    });
                }
            }
            b"tc" if self.table_depth == 1 => {
                self.row.push(std::mem::take(&mut self.cell));
            }
            b"tr" if self.table_depth == 1 => {
                self.table.push(std::mem::take(&mut self.row));
            }
            b"tbl" => {
                self.table_depth = self.table_depth.saturating_sub(1);
                if self.table_depth == 0 {
                    self.blocks.push(Block::Table(std::mem::take(&mut self.table)));
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        if self.in_text_run {
            self.paragraph.push_str(text);
        }
    }
}

fn read_properties(xml: &str) -> Result<DocxProperties, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut props = DocxProperties::default();
    let mut current: Option<Vec<u8>> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => current = Some(e.local_name().as_ref().to_vec()),
            Event::End(_) => current = None,
            Event::Text(t) => {
                let Some(name) = current.as_deref() else { continue };
                let slot = match name {
                    b"title" => &mut props.title,
                    b"creator" => &mut props.author,
                    b"subject" => &mut props.subject,
                    b"keywords" => &mut props.keywords,
                    b"created" => &mut props.created,
                    b"modified" => &mut props.modified,
                    b"lastModifiedBy" => &mut props.last_modified_by,
                    _ => continue,
                };
                let value = t.unescape()?.trim().to_string();
                if !value.is_empty() {
                    *slot = Some(value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(props)
}

/// Word (.docx) extraction: paragraphs and tables in document order.
/// Tables become `[Table N]` blocks with one ` | `-joined line per row.
pub struct DocxExtractor;

impl DocxExtractor {
    /// The document part, plus the core properties part when the archive has one
    fn read_parts(bytes: &[u8]) -> Result<(String, Option<String>), ExtractError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

        let mut document = String::new();
        archive.by_name(DOCUMENT_XML)?.read_to_string(&mut document)?;

        let core = match archive.by_name(CORE_XML) {
            Ok(mut entry) => {
                let mut xml = String::new();
                entry.read_to_string(&mut xml)?;
                Some(xml)
            }
            Err(zip::result::ZipError::FileNotFound) => None,
            Err(e) => return Err(e.into()),
        };
        Ok((document, core))
    }

    fn walk(xml: &str) -> Result<Vec<Block>, ExtractError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut walker = BodyWalker::default();
        loop {
            match reader.read_event()? {
                Event::Start(e) => walker.start(&e),
                Event::Empty(e) => walker.empty(&e),
                Event::End(e) => walker.end(e.local_name().as_ref()),
                Event::Text(t) => walker.text(&t.unescape()?),
                Event::CData(t) => walker.text(&String::from_utf8_lossy(&t)),
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(walker.blocks)
    }

    fn render(blocks: Vec<Block>) -> (String, DocxFields) {
        let mut parts = Vec::with_capacity(blocks.len());
        let mut fields = DocxFields {
            paragraph_count: 0,
            heading_count: 0,
            table_count: 0,
            tables: Vec::new(),
            properties: DocxProperties::default(),
        };

        for block in blocks {
            match block {
                Block::Paragraph { text, heading } => {
                    fields.paragraph_count += 1;
                    if heading {
                        fields.heading_count += 1;
                        parts.push(format!("## {}", text));
                    } else {
                        parts.push(text);
                    }
                }
                Block::Table(rows) => {
                    fields.table_count += 1;
                    let mut rendered = format!("[Table {}]", fields.table_count);
                    for row in &rows {
                        rendered.push('\n');
                        rendered.push_str(&row.join(" | "));
                    }
                    parts.push(rendered);
                    fields.tables.push(rows);
                }
            }
        }

        (parts.join("\n\n"), fields)
    }
}

impl Extractor for DocxExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Docx
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["docx"]
    }

    fn extract(&self, bytes: &[u8], file_name: &str) -> Result<Extraction, ExtractError> {
        let (xml, core) = Self::read_parts(bytes)?;
        let blocks = Self::walk(&xml)?;
        let (text, mut fields) = Self::render(blocks);

        debug!(
            "DOCX {}: {} paragraphs, {} tables",
            file_name, fields.paragraph_count, fields.table_count
        );

        let mut notes = Vec::new();
        if let Some(core) = core {
            // Broken metadata never costs the body text
            match read_properties(&core) {
                Ok(props) => fields.properties = props,
                Err(e) => notes.push(ExtractionNote::new(format!(
                    "Could not read document properties: {}",
                    e
                ))),
            }
        }
        if text.trim().is_empty() {
            notes.push(ExtractionNote::new("Document contains no text"));
        }

        Ok(Extraction::new(text, StructuredFields::Docx(fields)).with_notes(notes))
    }
}
