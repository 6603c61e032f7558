pub mod dispatcher;
pub mod error;
pub mod extractors;
pub mod types;

pub use dispatcher::{FormatInfo, ProcessingDispatcher, Upload};
pub use error::{ExtractError, ProcessError};
pub use extractors::Extractor;
pub use types::{
    ExtractedContent, ExtractionNote, FileMetadata, SourceKind, StructuredFields,
};
