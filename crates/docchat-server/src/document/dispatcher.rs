use futures::future::join_all;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::utils::limiters::Limiters;

use super::error::{ExtractError, ProcessError};
use super::extractors::{
    CsvExtractor, DocxExtractor, Extractor, ImageExtractor, PdfExtractor, TesseractOcr,
    TextDecoder, TextExtractor,
};
use super::types::{file_extension, ExtractedContent, ExtractionNote, FileMetadata, SourceKind};

/// One file as handed over by the upload surface
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_name: String,
}

impl Upload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
            file_name: file_name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatInfo {
    pub kind: SourceKind,
    pub mime_types: Vec<&'static str>,
    pub extensions: Vec<&'static str>,
}

/// Lower-cased type/subtype with parameters dropped
fn normalize_mime(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Routes an upload to exactly one extractor and contains whatever goes wrong inside it.
///
/// Selection is two ordered passes over the registered extractors: declared MIME type
/// first, file extension second. Registration order breaks ties.
#[derive(Clone)]
pub struct ProcessingDispatcher {
    extractors: Arc<[Box<dyn Extractor>]>,
    limiters: Option<Limiters>,
}

impl ProcessingDispatcher {
    pub fn new(extractors: Vec<Box<dyn Extractor>>) -> Self {
        Self {
            extractors: extractors.into(),
            limiters: None,
        }
    }

    /// PDF, DOCX, CSV, image and plain text, in that order
    pub fn with_defaults(settings: &Settings) -> Self {
        let decoder = TextDecoder::from_labels(&settings.text.encodings);
        // A stuck OCR child is killed no later than the extraction itself gives up
        let image = if settings.ocr.enabled {
            let ocr = TesseractOcr::from_config(&settings.ocr)
                .with_timeout(settings.limits.extraction_timeout());
            ImageExtractor::new(Arc::new(ocr))
        } else {
            ImageExtractor::without_ocr()
        };

        Self::new(vec![
            Box::new(PdfExtractor),
            Box::new(DocxExtractor),
            Box::new(CsvExtractor::new(decoder.clone())),
            Box::new(image),
            Box::new(TextExtractor::new(decoder)),
        ])
    }

    pub fn with_limiters(mut self, limiters: Limiters) -> Self {
        self.limiters = Some(limiters);
        self
    }

    pub fn supported_formats(&self) -> Vec<FormatInfo> {
        self.extractors
            .iter()
            .map(|e| FormatInfo {
                kind: e.kind(),
                mime_types: e.mime_types().to_vec(),
                extensions: e.extensions().to_vec(),
            })
            .collect()
    }

    fn select(&self, mime_type: &str, file_name: &str) -> Option<usize> {
        let mime = normalize_mime(mime_type);
        if !mime.is_empty() {
            if let Some(idx) = self.extractors.iter().position(|e| e.accepts_mime(&mime)) {
                return Some(idx);
            }
        }

        // Nobody claimed the MIME type, so this pass falls back to the extension
        self.extractors
            .iter()
            .position(|e| e.can_process(&mime, file_name))
    }

    /// Size check then extractor selection, both before any extraction work
    fn admit(&self, size: u64, mime_type: &str, file_name: &str, size_limit: u64) -> Result<usize, ProcessError> {
        if size > size_limit {
            debug!("Rejecting {}: {} bytes over limit {}", file_name, size, size_limit);
            return Err(ProcessError::SizeExceeded {
                size,
                limit: size_limit,
            });
        }

        self.select(mime_type, file_name)
            .ok_or_else(|| ProcessError::UnsupportedFormat {
                mime_type: mime_type.to_string(),
                extension: file_extension(file_name),
            })
    }

    fn metadata(mime_type: &str, file_name: &str, size: u64) -> FileMetadata {
        let mime = normalize_mime(mime_type);
        let mime = if mime.is_empty() || mime == "application/octet-stream" {
            mime_guess::from_path(file_name)
                .first_raw()
                .map(str::to_string)
                .unwrap_or(mime)
        } else {
            mime
        };
        FileMetadata::new(file_name, &mime, size)
    }

    /// Run one extractor, folding errors and panics into the content's notes
    fn run(extractor: &dyn Extractor, bytes: &[u8], file: FileMetadata) -> ExtractedContent {
        let kind = extractor.kind();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(bytes, &file.name)));

        match outcome {
            Ok(Ok(extraction)) => ExtractedContent::from_extraction(kind, file, extraction),
            Ok(Err(e)) => {
                warn!("{} extraction failed for {}: {}", kind, file.name, e);
                ExtractedContent::failed(kind, file, ExtractionNote::new(e.to_string()))
            }
            Err(payload) => {
                let err = ExtractError::Panicked(panic_message(payload));
                warn!("{} extractor panicked on {}: {}", kind, file.name, err);
                ExtractedContent::failed(kind, file, ExtractionNote::new(err.to_string()))
            }
        }
    }

    /// Synchronous pipeline entry. Blocks the calling thread for the whole extraction.
    pub fn process(
        &self,
        bytes: &[u8],
        mime_type: &str,
        file_name: &str,
        size_limit: u64,
    ) -> Result<ExtractedContent, ProcessError> {
        let size = bytes.len() as u64;
        let idx = self.admit(size, mime_type, file_name, size_limit)?;
        let file = Self::metadata(mime_type, file_name, size);
        debug!("Dispatching {} to {} extractor", file_name, self.extractors[idx].kind());
        Ok(Self::run(self.extractors[idx].as_ref(), bytes, file))
    }

    /// Extraction on the blocking pool, bounded by `timeout` and the extraction limiter.
    pub async fn process_bounded(
        &self,
        upload: Upload,
        size_limit: u64,
        timeout: Duration,
    ) -> Result<ExtractedContent, ProcessError> {
        let size = upload.bytes.len() as u64;
        let idx = self.admit(size, &upload.mime_type, &upload.file_name, size_limit)?;

        let permit = match &self.limiters {
            Some(limiters) => Some(
                limiters
                    .acquire_extraction()
                    .await
                    .map_err(|e| ProcessError::Busy(e.to_string()))?,
            ),
            None => None,
        };

        let file = Self::metadata(&upload.mime_type, &upload.file_name, size);
        let fallback = file.clone();
        let kind = self.extractors[idx].kind();
        let extractors = Arc::clone(&self.extractors);
        debug!("Dispatching {} to {} extractor", upload.file_name, kind);

        // The permit rides along so an abandoned extraction still counts against the limit
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            Self::run(extractors[idx].as_ref(), &upload.bytes, file)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(join_err)) => {
                warn!("Extraction task for {} did not complete: {}", fallback.name, join_err);
                Ok(ExtractedContent::failed(
                    kind,
                    fallback,
                    ExtractionNote::new(format!("Extraction task failed: {}", join_err)),
                ))
            }
            Err(_) => {
                warn!("Extraction of {} timed out after {:?}", fallback.name, timeout);
                Err(ProcessError::Timeout(timeout))
            }
        }
    }

    /// Every upload gets its own result; one bad file never fails the others.
    pub async fn process_batch(
        &self,
        uploads: Vec<Upload>,
        size_limit: u64,
        timeout: Duration,
        max_files: usize,
    ) -> Result<Vec<Result<ExtractedContent, ProcessError>>, ProcessError> {
        if uploads.len() > max_files {
            return Err(ProcessError::BatchTooLarge {
                count: uploads.len(),
                limit: max_files,
            });
        }

        let results = join_all(
            uploads
                .into_iter()
                .map(|upload| self.process_bounded(upload, size_limit, timeout)),
        )
        .await;

        let failed = results
            .iter()
            .filter(|r| r.as_ref().map(|c| !c.is_clean()).unwrap_or(true))
            .count();
        if failed > 0 {
            debug!("Batch of {} finished with {} files failing or partial", results.len(), failed);
        }

        Ok(results)
    }
}
