use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8, WINDOWS_1252};
use std::borrow::Cow;
use tracing::{debug, warn};

use crate::document::error::ExtractError;
use crate::document::types::{
    file_extension, Extraction, ExtractionNote, SourceKind, StructuredFields, TextFields,
    TextFormat,
};

use super::Extractor;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Result of running the candidate list over a byte buffer
#[derive(Debug, Clone)]
pub struct Decoded {
    pub text: String,
    pub encoding: &'static Encoding,
    /// Every candidate failed and invalid bytes were replaced
    pub lossy: bool,
}

/// Prioritized encoding detection. The first candidate that decodes without errors wins.
#[derive(Debug, Clone)]
pub struct TextDecoder {
    candidates: Vec<&'static Encoding>,
}

impl TextDecoder {
    pub fn new(candidates: Vec<&'static Encoding>) -> Self {
        if candidates.is_empty() {
            return Self::default();
        }
        Self { candidates }
    }

    /// Build from WHATWG labels (`utf-8`, `windows-1252`, ...). Unknown labels are skipped.
    pub fn from_labels(labels: &[String]) -> Self {
        let candidates = labels
            .iter()
            .filter_map(|label| {
                let encoding = Encoding::for_label(label.trim().as_bytes());
                if encoding.is_none() {
                    warn!("Unknown text encoding label '{}', skipping", label);
                }
                encoding
            })
            .collect();
        Self::new(candidates)
    }

    pub fn candidates(&self) -> &[&'static Encoding] {
        &self.candidates
    }

    pub fn decode(&self, bytes: &[u8]) -> Decoded {
        for &encoding in &self.candidates {
            if let Some(text) = Self::try_decode(encoding, bytes) {
                return Decoded {
                    text: text.into_owned(),
                    encoding,
                    lossy: false,
                };
            }
            debug!("Decoding as {} failed, trying next candidate", encoding.name());
        }

        Decoded {
            text: String::from_utf8_lossy(bytes).into_owned(),
            encoding: UTF_8,
            lossy: true,
        }
    }

    fn try_decode<'a>(encoding: &'static Encoding, bytes: &'a [u8]) -> Option<Cow<'a, str>> {
        if encoding == UTF_8 {
            let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
            return std::str::from_utf8(body).ok().map(Cow::Borrowed);
        }

        if encoding == UTF_16LE || encoding == UTF_16BE {
            // Without a BOM almost any even-length buffer "decodes" as UTF-16
            return match Encoding::for_bom(bytes) {
                Some((bom_encoding, bom_len)) if bom_encoding == encoding => encoding
                    .decode_without_bom_handling_and_without_replacement(&bytes[bom_len..]),
                _ => None,
            };
        }

        encoding.decode_without_bom_handling_and_without_replacement(bytes)
    }
}

impl Default for TextDecoder {
    fn default() -> Self {
        Self {
            candidates: vec![UTF_8, UTF_16LE, UTF_16BE, WINDOWS_1252],
        }
    }
}

/// Guess how the text is structured, extension first
pub fn detect_text_format(content: &str, file_name: &str) -> TextFormat {
    match file_extension(file_name).as_deref() {
        Some("json") => return TextFormat::Json,
        Some("csv") | Some("tsv") => return TextFormat::Csv,
        Some("md") | Some("markdown") => return TextFormat::Markdown,
        Some("py") | Some("js") | Some("ts") | Some("rs") | Some("html") | Some("css")
        | Some("go") | Some("java") | Some("c") | Some("cpp") | Some("sh") => {
            return TextFormat::Code
        }
        _ => {}
    }

    let trimmed = content.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return TextFormat::Json;
    }

    if content.contains(',') && content.contains('\n') {
        let mut lines = content.lines().take(5).filter(|l| !l.trim().is_empty()).peekable();
        if lines.peek().is_some() && lines.all(|l| l.contains(',')) {
            return TextFormat::Csv;
        }
    }

    TextFormat::Plain
}

pub struct TextExtractor {
    decoder: TextDecoder,
}

impl TextExtractor {
    pub fn new(decoder: TextDecoder) -> Self {
        Self { decoder }
    }
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self::new(TextDecoder::default())
    }
}

impl Extractor for TextExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Text
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["text/plain", "text/markdown", "application/json", "text/html", "text/css", "application/xml", "text/xml"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[
            "txt", "md", "markdown", "json", "log", "py", "js", "ts", "rs", "html", "css", "xml",
            "yaml", "yml", "toml", "go", "java", "c", "cpp", "sh",
        ]
    }

    /// Never fails: undecodable input comes back lossy with a note.
    fn extract(&self, bytes: &[u8], file_name: &str) -> Result<Extraction, ExtractError> {
        let decoded = self.decoder.decode(bytes);

        let mut notes = Vec::new();
        if decoded.lossy {
            let tried: Vec<&str> = self.decoder.candidates().iter().map(|e| e.name()).collect();
            warn!("Could not decode {} with any of {:?}", file_name, tried);
            notes.push(ExtractionNote::new(format!(
                "Could not decode text with any of [{}]; invalid bytes were replaced",
                tried.join(", ")
            )));
        }

        let text = decoded.text;
        let fields = TextFields {
            encoding: decoded.encoding.name().to_string(),
            format: detect_text_format(&text, file_name),
            line_count: text.lines().count(),
            word_count: text.split_whitespace().count(),
            char_count: text.chars().count(),
        };

        Ok(Extraction::new(text, StructuredFields::Text(fields)).with_notes(notes))
    }
}
