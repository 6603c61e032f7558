use ::csv::{ReaderBuilder, Trim};
use tracing::{debug, warn};

use crate::document::error::ExtractError;
use crate::document::types::{
    file_extension, ColumnStats, CsvFields, CsvMode, Extraction, ExtractionNote, SourceKind,
    StructuredFields,
};

use super::text::TextDecoder;
use super::Extractor;

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];
const SNIFF_LINES: usize = 5;
const PREVIEW_ROWS: usize = 10;
const TEXT_ROWS: usize = 100;

/// Pick the delimiter that splits the first lines most consistently
pub fn sniff_delimiter(sample: &str, file_name: &str) -> u8 {
    if file_extension(file_name).as_deref() == Some("tsv") {
        return b'\t';
    }

    let lines: Vec<&str> = sample
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(SNIFF_LINES)
        .collect();
    let Some(first) = lines.first() else {
        return b',';
    };

    let count = |line: &str, d: u8| line.bytes().filter(|b| *b == d).count();

    let consistent = CANDIDATE_DELIMITERS
        .iter()
        .copied()
        .filter(|&d| count(first, d) > 0 && lines.iter().all(|l| count(l, d) == count(first, d)))
        .max_by_key(|&d| count(first, d));

    consistent
        .or_else(|| {
            CANDIDATE_DELIMITERS
                .iter()
                .copied()
                .filter(|&d| count(first, d) > 0)
                .max_by_key(|&d| count(first, d))
        })
        .unwrap_or(b',')
}

fn delimiter_label(delimiter: u8) -> String {
    match delimiter {
        b'\t' => "\\t".to_string(),
        other => (other as char).to_string(),
    }
}

fn parse_table(text: &str, delimiter: u8) -> Result<(Vec<String>, Vec<Vec<String>>), ExtractError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(false)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ExtractError::Malformed("missing header row".to_string()));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok((headers, rows))
}

/// Stats for columns whose non-empty cells are all numbers
fn numeric_columns(headers: &[String], rows: &[Vec<String>]) -> Vec<ColumnStats> {
    headers
        .iter()
        .enumerate()
        .filter_map(|(idx, header)| {
            let mut values = Vec::with_capacity(rows.len());
            let mut missing = 0;
            for row in rows {
                let cell = row.get(idx).map(|c| c.trim()).unwrap_or("");
                if cell.is_empty() {
                    missing += 1;
                    continue;
                }
                values.push(cell.parse::<f64>().ok().filter(|v| v.is_finite())?);
            }
            if values.is_empty() {
                return None;
            }
            // Running mean; a plain sum overflows for values near f64::MAX
            let mut mean = 0.0_f64;
            for (i, v) in values.iter().enumerate() {
                let n = (i + 1) as f64;
                mean += v / n - mean / n;
            }
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            // Non-finite numbers do not survive JSON
            if !(mean.is_finite() && min.is_finite() && max.is_finite()) {
                return None;
            }
            Some(ColumnStats {
                column: header.clone(),
                count: values.len(),
                missing,
                mean,
                min,
                max,
            })
        })
        .collect()
}

fn render_table(headers: &[String], rows: &[Vec<String>], stats: &[ColumnStats]) -> String {
    let mut out = format!(
        "CSV with {} rows and {} columns\nColumns: {}\n",
        rows.len(),
        headers.len(),
        headers.join(", ")
    );

    for column in stats {
        out.push_str(&format!(
            "{}: mean {:.2}, min {}, max {}\n",
            column.column, column.mean, column.min, column.max
        ));
    }

    out.push('\n');
    out.push_str(&headers.join(" | "));
    for row in rows.iter().take(TEXT_ROWS) {
        out.push('\n');
        out.push_str(&row.join(" | "));
    }
    if rows.len() > TEXT_ROWS {
        out.push_str(&format!("\n... ({} more rows)", rows.len() - TEXT_ROWS));
    }
    out
}

/// CSV/TSV extraction. Malformed files fall back to the decoded raw text.
pub struct CsvExtractor {
    decoder: TextDecoder,
}

impl CsvExtractor {
    pub fn new(decoder: TextDecoder) -> Self {
        Self { decoder }
    }
}

impl Default for CsvExtractor {
    fn default() -> Self {
        Self::new(TextDecoder::default())
    }
}

impl Extractor for CsvExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Csv
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["text/csv", "text/tab-separated-values", "application/csv"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["csv", "tsv"]
    }

    fn extract(&self, bytes: &[u8], file_name: &str) -> Result<Extraction, ExtractError> {
        let decoded = self.decoder.decode(bytes);
        let encoding = decoded.encoding.name().to_string();
        let text = decoded.text;

        let mut notes = Vec::new();
        if decoded.lossy {
            notes.push(ExtractionNote::new(
                "Could not decode text with any configured encoding; invalid bytes were replaced",
            ));
        }

        if text.trim().is_empty() {
            notes.push(ExtractionNote::new("File is empty"));
            let fields = CsvFields {
                mode: CsvMode::Tabular,
                delimiter: ",".to_string(),
                encoding,
                headers: Vec::new(),
                row_count: 0,
                column_count: 0,
                numeric_columns: Vec::new(),
                preview_rows: Vec::new(),
            };
            return Ok(Extraction::new(String::new(), StructuredFields::Csv(fields)).with_notes(notes));
        }

        let delimiter = sniff_delimiter(&text, file_name);
        debug!("CSV {}: sniffed delimiter '{}'", file_name, delimiter_label(delimiter));

        match parse_table(&text, delimiter) {
            Ok((headers, rows)) => {
                let stats = numeric_columns(&headers, &rows);
                let rendered = render_table(&headers, &rows, &stats);
                let fields = CsvFields {
                    mode: CsvMode::Tabular,
                    delimiter: delimiter_label(delimiter),
                    encoding,
                    column_count: headers.len(),
                    row_count: rows.len(),
                    numeric_columns: stats,
                    preview_rows: rows.iter().take(PREVIEW_ROWS).cloned().collect(),
                    headers,
                };
                Ok(Extraction::new(rendered, StructuredFields::Csv(fields)).with_notes(notes))
            }
            Err(e) => {
                warn!("CSV {} could not be parsed, keeping raw text: {}", file_name, e);
                notes.push(ExtractionNote::new(format!(
                    "Could not parse as a table ({}); returning raw text",
                    e
                )));
                let fields = CsvFields {
                    mode: CsvMode::RawText,
                    delimiter: delimiter_label(delimiter),
                    encoding,
                    headers: Vec::new(),
                    row_count: 0,
                    column_count: 0,
                    numeric_columns: Vec::new(),
                    preview_rows: Vec::new(),
                };
                Ok(Extraction::new(text, StructuredFields::Csv(fields)).with_notes(notes))
            }
        }
    }
}
