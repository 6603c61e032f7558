use image::ImageReader;
use std::io::{Cursor, ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::OcrConfig;
use crate::document::error::ExtractError;
use crate::document::types::{Extraction, ExtractionNote, ImageFields, SourceKind, StructuredFields};

use super::Extractor;

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("OCR engine unavailable: {0}")]
    Unavailable(String),

    #[error("OCR failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    pub text: String,
    /// Mean word confidence, 0-100
    pub confidence: Option<f32>,
    pub word_count: usize,
}

/// Blocking OCR step. Runs on the blocking pool, never under a store lock.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image: &[u8]) -> Result<OcrOutput, OcrError>;
}

const DEFAULT_OCR_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shells out to the `tesseract` CLI in TSV mode, image on stdin.
/// The child is killed once `timeout` elapses.
pub struct TesseractOcr {
    command: String,
    language: String,
    timeout: Duration,
}

impl TesseractOcr {
    pub fn new(command: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            language: language.into(),
            timeout: DEFAULT_OCR_TIMEOUT,
        }
    }

    pub fn from_config(cfg: &OcrConfig) -> Self {
        Self::new(&cfg.command, &cfg.language)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Poll until the child exits or the deadline passes. A late child is
    /// killed and reaped so it cannot outlive the extraction slot.
    fn wait_until(&self, child: &mut Child, deadline: Option<Instant>) -> Result<ExitStatus, OcrError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if deadline.is_some_and(|d| Instant::now() >= d) => {
                    if let Err(e) = child.kill() {
                        warn!("Killing {} failed: {}", self.command, e);
                    }
                    let _ = child.wait();
                    return Err(OcrError::Failed(format!(
                        "{} timed out after {} ms",
                        self.command,
                        self.timeout.as_millis()
                    )));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(OcrError::Failed(e.to_string())),
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

impl OcrEngine for TesseractOcr {
    fn recognize(&self, image: &[u8]) -> Result<OcrOutput, OcrError> {
        // An unrepresentable deadline means no deadline
        let deadline = Instant::now().checked_add(self.timeout);
        let mut child = Command::new(&self.command)
            .args(["stdin", "stdout", "-l", self.language.as_str(), "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    OcrError::Unavailable(format!("'{}' not found on PATH", self.command))
                }
                _ => OcrError::Unavailable(e.to_string()),
            })?;

        // Pipes are serviced off-thread so a full buffer cannot stall the child
        let writer = child.stdin.take().map(|mut stdin| {
            let input = image.to_vec();
            std::thread::spawn(move || stdin.write_all(&input))
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        // On timeout the pipe threads are left detached, a grandchild may still hold the pipes
        let status = self.wait_until(&mut child, deadline)?;

        if let Some(handle) = writer {
            match handle.join() {
                Ok(Err(e)) => debug!("Writing image to {} stdin failed: {}", self.command, e),
                Err(_) => return Err(OcrError::Failed("stdin writer panicked".to_string())),
                Ok(Ok(())) => {}
            }
        }
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            warn!("Tesseract failed: {}", stderr.trim());
            return Err(OcrError::Failed(format!("{} exited with {}", self.command, status)));
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&stdout)))
    }
}

/// Rebuild text from Tesseract TSV: words (level 5) joined per line,
/// a blank line between paragraphs.
pub fn parse_tsv(tsv: &str) -> OcrOutput {
    let mut text = String::new();
    let mut confidences = Vec::new();
    let mut last_line: Option<(&str, &str, &str)> = None;
    let mut last_par: Option<(&str, &str)> = None;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }

        let par = (cols[2], cols[3]);
        let line = (cols[2], cols[3], cols[4]);
        if last_line != Some(line) {
            if last_par.is_some() {
                text.push_str(if last_par != Some(par) { "\n\n" } else { "\n" });
            }
            last_line = Some(line);
            last_par = Some(par);
        } else {
            text.push(' ');
        }
        text.push_str(word);

        if let Ok(conf) = cols[10].trim().parse::<f32>() {
            if conf >= 0.0 {
                confidences.push(conf);
            }
        }
    }

    let confidence = (!confidences.is_empty())
        .then(|| confidences.iter().sum::<f32>() / confidences.len() as f32);

    OcrOutput {
        word_count: text.split_whitespace().count(),
        text,
        confidence,
    }
}

/// Image extraction: format and dimensions from the `image` crate, text from OCR.
/// OCR problems become notes, never errors.
pub struct ImageExtractor {
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl ImageExtractor {
    pub fn new(ocr: Arc<dyn OcrEngine>) -> Self {
        Self { ocr: Some(ocr) }
    }

    pub fn without_ocr() -> Self {
        Self { ocr: None }
    }
}

impl Extractor for ImageExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Image
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &[
            "image/png",
            "image/jpeg",
            "image/jpg",
            "image/gif",
            "image/bmp",
            "image/tiff",
            "image/webp",
        ]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp"]
    }

    fn extract(&self, bytes: &[u8], file_name: &str) -> Result<Extraction, ExtractError> {
        let mut notes = Vec::new();
        let mut fields = ImageFields {
            format: None,
            width: None,
            height: None,
            ocr_confidence: None,
            ocr_word_count: 0,
        };

        let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        match reader.format() {
            Some(format) => {
                fields.format = format.extensions_str().first().map(|ext| ext.to_string());
                match reader.into_dimensions() {
                    Ok((width, height)) => {
                        fields.width = Some(width);
                        fields.height = Some(height);
                    }
                    Err(e) => notes.push(ExtractionNote::new(format!(
                        "Could not read image dimensions: {}",
                        e
                    ))),
                }
            }
            None => notes.push(ExtractionNote::new("Unrecognized image format")),
        }

        let mut text = String::new();
        match &self.ocr {
            None => notes.push(ExtractionNote::new("OCR engine unavailable: OCR is disabled")),
            Some(engine) => match engine.recognize(bytes) {
                Ok(output) if output.text.trim().is_empty() => {
                    notes.push(ExtractionNote::new("No text detected in image"));
                }
                Ok(output) => {
                    debug!(
                        "OCR on {}: {} words, confidence {:?}",
                        file_name, output.word_count, output.confidence
                    );
                    fields.ocr_confidence = output.confidence;
                    fields.ocr_word_count = output.word_count;
                    text = output.text;
                }
                Err(e) => {
                    warn!("OCR on {} failed: {}", file_name, e);
                    notes.push(ExtractionNote::new(e.to_string()));
                }
            },
        }

        Ok(Extraction::new(text, StructuredFields::Image(fields)).with_notes(notes))
    }
}
