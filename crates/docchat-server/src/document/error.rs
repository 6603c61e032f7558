use std::time::Duration;
use thiserror::Error;

/// Dispatcher-level failures. These reach the caller.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Unsupported file format: type '{mime_type}', extension '{}'", .extension.as_deref().unwrap_or("none"))]
    UnsupportedFormat {
        mime_type: String,
        extension: Option<String>,
    },

    #[error("File is {size} bytes, the limit is {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("Extraction did not finish within {0:?}")]
    Timeout(Duration),

    #[error("{count} files uploaded at once, the limit is {limit}")]
    BatchTooLarge { count: usize, limit: usize },

    #[error("Extraction is busy: {0}")]
    Busy(String),
}

/// Extractor-level failures. The dispatcher folds these into `ExtractedContent`.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("Extractor panicked: {0}")]
    Panicked(String),
}
