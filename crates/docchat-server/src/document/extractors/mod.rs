//! Format extractors
//!
//! Each extractor turns the bytes of one file kind into text plus
//! kind-specific fields. Partial failures travel as notes on the
//! `Extraction`; a returned `Err` means nothing usable came out.

pub mod csv;
pub mod docx;
pub mod image;
pub mod pdf;
pub mod text;

pub use self::csv::CsvExtractor;
pub use self::docx::DocxExtractor;
pub use self::image::{ImageExtractor, OcrEngine, OcrError, OcrOutput, TesseractOcr};
pub use self::pdf::PdfExtractor;
pub use self::text::{TextDecoder, TextExtractor};

use super::error::ExtractError;
use super::types::{file_extension, Extraction, SourceKind};

pub trait Extractor: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Lower-case MIME types this extractor claims
    fn mime_types(&self) -> &'static [&'static str];

    /// Lower-case extensions without the dot
    fn extensions(&self) -> &'static [&'static str];

    fn accepts_mime(&self, mime_type: &str) -> bool {
        self.mime_types()
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mime_type))
    }

    fn accepts_extension(&self, extension: &str) -> bool {
        self.extensions()
            .iter()
            .any(|e| e.eq_ignore_ascii_case(extension))
    }

    fn can_process(&self, mime_type: &str, file_name: &str) -> bool {
        self.accepts_mime(mime_type)
            || file_extension(file_name)
                .map(|ext| self.accepts_extension(&ext))
                .unwrap_or(false)
    }

    fn extract(&self, bytes: &[u8], file_name: &str) -> Result<Extraction, ExtractError>;
}
