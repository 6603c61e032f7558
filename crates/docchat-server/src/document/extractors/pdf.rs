use encoding_rs::UTF_16BE;
use lopdf::{Dictionary, Document as PdfDocument, Object};
use tracing::{debug, warn};

use crate::document::error::ExtractError;
use crate::document::types::{Extraction, ExtractionNote, PdfFields, SourceKind, StructuredFields};

use super::Extractor;

/// Page-by-page text extraction with lopdf.
///
/// Every page gets a `--- Page N ---` marker, including pages that yield no
/// text; those are also reported as a note so scanned pages are visible.
pub struct PdfExtractor;

impl PdfExtractor {
    pub fn page_marker(page_num: u32) -> String {
        format!("--- Page {} ---", page_num)
    }

    fn info_dictionary(doc: &PdfDocument) -> Option<&Dictionary> {
        match doc.trailer.get(b"Info").ok()? {
            Object::Reference(id) => doc.get_dictionary(*id).ok(),
            Object::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    fn info_string(info: Option<&Dictionary>, key: &[u8]) -> Option<String> {
        let raw = info?.get(key).ok()?.as_str().ok()?;
        let text = match raw.strip_prefix(b"\xFE\xFF") {
            Some(utf16) => UTF_16BE.decode_without_bom_handling(utf16).0.into_owned(),
            None => String::from_utf8_lossy(raw).into_owned(),
        };
        let text = text.trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

impl Extractor for PdfExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Pdf
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["application/pdf"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pdf"]
    }

    fn extract(&self, bytes: &[u8], file_name: &str) -> Result<Extraction, ExtractError> {
        let doc = PdfDocument::load_mem(bytes)?;
        let pages = doc.get_pages();

        let mut content = String::new();
        let mut notes = Vec::new();
        let mut pages_without_text = Vec::new();

        for page_num in pages.keys().copied() {
            content.push_str(&Self::page_marker(page_num));
            content.push('\n');

            match doc.extract_text(&[page_num]) {
                Ok(text) if !text.trim().is_empty() => {
                    content.push_str(text.trim_end());
                    content.push_str("\n\n");
                }
                Ok(_) => {
                    debug!("Page {} of {} has no extractable text", page_num, file_name);
                    pages_without_text.push(page_num);
                    notes.push(ExtractionNote::at(
                        format!("page {}", page_num),
                        "No extractable text (scanned image or empty page)",
                    ));
                    content.push('\n');
                }
                Err(e) => {
                    warn!("Failed to extract text from page {} of {}: {}", page_num, file_name, e);
                    pages_without_text.push(page_num);
                    notes.push(ExtractionNote::at(
                        format!("page {}", page_num),
                        format!("Text extraction failed: {}", e),
                    ));
                    content.push('\n');
                }
            }
        }

        if pages.is_empty() {
            notes.push(ExtractionNote::new("Document has no pages"));
        }

        let info = Self::info_dictionary(&doc);
        let fields = PdfFields {
            page_count: pages.len(),
            pages_without_text,
            title: Self::info_string(info, b"Title"),
            author: Self::info_string(info, b"Author"),
        };

        Ok(Extraction::new(content.trim_end().to_string(), StructuredFields::Pdf(fields))
            .with_notes(notes))
    }
}
