use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// File kinds the pipeline knows how to normalize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Pdf,
    Docx,
    Csv,
    Image,
    Text,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pdf => "pdf",
            SourceKind::Docx => "docx",
            SourceKind::Csv => "csv",
            SourceKind::Image => "image",
            SourceKind::Text => "text",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recoverable problem met while extracting a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionNote {
    /// Where in the file, e.g. `page 2`
    pub location: Option<String>,
    pub message: String,
}

impl ExtractionNote {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            location: None,
            message: message.into(),
        }
    }

    pub fn at(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ExtractionNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}: {}", location, self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub extension: Option<String>,
    pub mime_type: String,
    pub size_bytes: u64,
    pub size_human: String,
    pub processed_at: DateTime<Utc>,
}

impl FileMetadata {
    pub fn new(name: &str, mime_type: &str, size_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            extension: file_extension(name),
            mime_type: mime_type.to_string(),
            size_bytes,
            size_human: format_file_size(size_bytes),
            processed_at: Utc::now(),
        }
    }
}

/// Lower-cased extension without the dot
pub fn file_extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_lowercase())
}

/// `1536` -> `1.5 KB`
pub fn format_file_size(size_bytes: u64) -> String {
    let mut size = size_bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextFormat {
    Json,
    Csv,
    Markdown,
    Code,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfFields {
    pub page_count: usize,
    pub pages_without_text: Vec<u32>,
    pub title: Option<String>,
    pub author: Option<String>,
}

/// Core properties from `docProps/core.xml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocxProperties {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub keywords: Option<String>,
    /// W3CDTF timestamps, kept as written
    pub created: Option<String>,
    pub modified: Option<String>,
    pub last_modified_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocxFields {
    pub paragraph_count: usize,
    pub heading_count: usize,
    pub table_count: usize,
    /// table -> row -> cell
    pub tables: Vec<Vec<Vec<String>>>,
    #[serde(default)]
    pub properties: DocxProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvMode {
    Tabular,
    /// Parsing failed, the text is the decoded file as-is
    RawText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column: String,
    pub count: usize,
    pub missing: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvFields {
    pub mode: CsvMode,
    pub delimiter: String,
    pub encoding: String,
    pub headers: Vec<String>,
    pub row_count: usize,
    pub column_count: usize,
    pub numeric_columns: Vec<ColumnStats>,
    pub preview_rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFields {
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub ocr_confidence: Option<f32>,
    pub ocr_word_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFields {
    pub encoding: String,
    pub format: TextFormat,
    pub line_count: usize,
    pub word_count: usize,
    pub char_count: usize,
}

/// Kind-specific structure recovered next to the text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuredFields {
    Empty,
    Pdf(PdfFields),
    Docx(DocxFields),
    Csv(CsvFields),
    Image(ImageFields),
    Text(TextFields),
}

/// What an extractor hands back on success. Notes carry partial failures.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub fields: StructuredFields,
    pub notes: Vec<ExtractionNote>,
}

impl Extraction {
    pub fn new(text: String, fields: StructuredFields) -> Self {
        Self {
            text,
            fields,
            notes: Vec::new(),
        }
    }

    pub fn with_notes(mut self, notes: Vec<ExtractionNote>) -> Self {
        self.notes = notes;
        self
    }
}

/// Normalized form of one uploaded file. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub source_kind: SourceKind,
    pub file: FileMetadata,
    pub extracted_text: String,
    pub structured_fields: StructuredFields,
    pub extraction_errors: Vec<ExtractionNote>,
}

impl ExtractedContent {
    pub fn from_extraction(source_kind: SourceKind, file: FileMetadata, extraction: Extraction) -> Self {
        Self {
            source_kind,
            file,
            extracted_text: extraction.text,
            structured_fields: extraction.fields,
            extraction_errors: extraction.notes,
        }
    }

    /// Content for a file whose extractor failed outright
    pub fn failed(source_kind: SourceKind, file: FileMetadata, note: ExtractionNote) -> Self {
        Self {
            source_kind,
            file,
            extracted_text: String::new(),
            structured_fields: StructuredFields::Empty,
            extraction_errors: vec![note],
        }
    }

    pub fn has_text(&self) -> bool {
        !self.extracted_text.trim().is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.extraction_errors.is_empty()
    }

    /// Stable digest of what a prompt would see from this attachment
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source_kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.file.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.extracted_text.as_bytes());
        hex::encode(hasher.finalize())
    }
}
