//! Delimited-text decoder with delimiter and header detection.

use std::fs::File;
use std::io::{BufRead, BufReader, Chain, Cursor, Read};
use std::path::Path;

use csv::{ByteRecord, ReaderBuilder};
use tracing::{debug, info, warn};

use super::{check_source, file_stem, Decoder};
use crate::config::DecoderConfig;
use crate::core::naming::normalize_field_name;
use crate::core::{Provenance, Record, SourceKind};
use crate::error::{MigrateError, Result};

/// Delimiters considered during detection.
const CANDIDATES: [u8; 5] = [b',', b';', b'\t', b'|', b':'];

/// Below this consistency score no candidate is trusted.
const MIN_DELIMITER_SCORE: f64 = 0.5;

/// Share of header-shaped tokens in row 1 needed to call it a header.
const HEADER_TOKEN_RATIO: f64 = 0.8;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Pick the delimiter whose per-line count (outside quotes) is most consistent.
///
/// Score is `1 / (1 + variance)`; ties go to the candidate yielding more columns.
/// Falls back to `,` when nothing scores at least [`MIN_DELIMITER_SCORE`].
pub fn detect_delimiter(lines: &[&str]) -> u8 {
    let lines: Vec<&str> = lines.iter().copied().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return b',';
    }

    let mut best: Option<(u8, f64, f64)> = None;
    for &candidate in &CANDIDATES {
        let counts: Vec<f64> = lines
            .iter()
            .map(|line| count_outside_quotes(line, candidate) as f64)
            .collect();
        let mean = counts.iter().sum::<f64>() / counts.len() as f64;
        if mean < 1.0 {
            continue;
        }
        let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64;
        let score = 1.0 / (1.0 + variance);

        let better = match best {
            None => true,
            Some((_, best_score, best_mean)) => {
                score > best_score + f64::EPSILON
                    || ((score - best_score).abs() <= f64::EPSILON && mean > best_mean)
            }
        };
        if better {
            best = Some((candidate, score, mean));
        }
    }

    match best {
        Some((delimiter, score, _)) if score >= MIN_DELIMITER_SCORE => delimiter,
        _ => b',',
    }
}

fn count_outside_quotes(line: &str, delimiter: u8) -> usize {
    let mut in_quotes = false;
    let mut count = 0;
    for b in line.bytes() {
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if b == delimiter && !in_quotes {
            count += 1;
        }
    }
    count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Empty,
    Numeric,
    Text,
}

fn cell_kind(value: &str) -> CellKind {
    let v = value.trim();
    if v.is_empty() {
        CellKind::Empty
    } else if v.parse::<f64>().is_ok() {
        CellKind::Numeric
    } else {
        CellKind::Text
    }
}

fn is_header_token(value: &str) -> bool {
    let v = value.trim();
    let mut chars = v.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    v.len() <= 64
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | ' ' | '-' | '.' | '(' | ')'))
}

/// Decide whether the first sampled row is a header.
fn detect_header(rows: &[Vec<String>]) -> bool {
    let first = match rows.first() {
        Some(first) if !first.is_empty() => first,
        _ => return false,
    };
    let first_kinds: Vec<CellKind> = first.iter().map(|v| cell_kind(v)).collect();
    if first_kinds.iter().any(|k| *k != CellKind::Text) {
        return false;
    }

    // Signal 1: row 1 is all text while row 2 has numbers in the same columns.
    if let Some(second) = rows.get(1) {
        let contrast = first_kinds
            .iter()
            .zip(second.iter())
            .any(|(k1, v2)| *k1 == CellKind::Text && cell_kind(v2) == CellKind::Numeric);
        if contrast {
            return true;
        }
    }

    // Signal 2: row 1 is made of distinct identifier-like tokens absent from the data.
    let shaped = first.iter().filter(|v| is_header_token(v)).count();
    let ratio = shaped as f64 / first.len() as f64;
    let mut distinct: Vec<&str> = first.iter().map(|v| v.trim()).collect();
    distinct.sort_unstable();
    distinct.dedup();
    let all_distinct = distinct.len() == first.len();
    let repeated_in_data = rows.iter().skip(1).any(|row| {
        row.iter()
            .zip(first.iter())
            .any(|(data, header)| data.trim() == header.trim())
    });

    // A lone row can only be a header when every cell is shaped like one.
    if rows.len() == 1 {
        return shaped == first.len() && all_distinct;
    }
    ratio >= HEADER_TOKEN_RATIO && all_distinct && !repeated_in_data
}

/// Normalize header names and make them unique.
fn unique_names(raw: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(raw.len());
    for r in raw {
        let base = normalize_field_name(r);
        let mut name = base.clone();
        let mut n = 2;
        while names.contains(&name) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        names.push(name);
    }
    names
}

/// Streaming decoder for delimited text.
pub struct TabularDecoder<R: Read> {
    reader: csv::Reader<Chain<Cursor<Vec<u8>>, BufReader<R>>>,
    headers: Vec<String>,
    source_names: Vec<String>,
    delimiter: u8,
    column_tolerance: Option<usize>,
    null_tokens: Vec<String>,
    position: u64,
    entity: Option<String>,
    estimated_total: Option<u64>,
    avg_row_bytes: Option<u64>,
    has_header: bool,
    bom_len: u64,
    buffer: ByteRecord,
}

impl TabularDecoder<File> {
    /// Open a delimited file.
    pub fn open(path: &Path, config: &DecoderConfig) -> Result<Self> {
        let size = check_source(path, config)?;
        let file = File::open(path)
            .map_err(|e| MigrateError::unreadable(path.display().to_string(), e.to_string()))?;
        let mut decoder = Self::from_reader(file, config, file_stem(path))?;
        decoder.estimate_from_size(size);
        info!(
            "Opened {} ({} columns, delimiter {:?})",
            path.display(),
            decoder.headers.len(),
            decoder.delimiter as char
        );
        Ok(decoder)
    }
}

impl<R: Read> TabularDecoder<R> {
    /// Build a decoder over any reader. `entity` names the records' entity.
    pub fn from_reader(reader: R, config: &DecoderConfig, entity: Option<String>) -> Result<Self> {
        let mut buffered = BufReader::new(reader);

        // Peek the first lines for detection, then replay them ahead of the rest.
        let mut sample = Vec::new();
        for _ in 0..config.sample_lines.max(2) {
            if buffered.read_until(b'\n', &mut sample)? == 0 {
                break;
            }
        }
        let bom_len = if sample.starts_with(UTF8_BOM) {
            sample.drain(..UTF8_BOM.len());
            UTF8_BOM.len() as u64
        } else {
            0
        };

        let text = String::from_utf8_lossy(&sample).into_owned();
        let lines: Vec<&str> = text.lines().collect();
        let avg_row_bytes = if lines.is_empty() {
            None
        } else {
            Some(sample.len() as u64 / lines.len() as u64)
        };
        let delimiter = match config.delimiter {
            Some(d) => d as u8,
            None => detect_delimiter(&lines),
        };

        let sampled_rows = parse_rows(&sample, delimiter);
        let has_header = config
            .has_header
            .unwrap_or_else(|| detect_header(&sampled_rows));

        let width = sampled_rows.first().map(|r| r.len()).unwrap_or(0);
        let source_names: Vec<String> = if has_header {
            sampled_rows.first().cloned().unwrap_or_default()
        } else {
            (1..=width).map(|i| format!("column_{}", i)).collect()
        };
        let headers = unique_names(&source_names);

        debug!(
            "Tabular source: delimiter {:?}, header {}, {} column(s)",
            delimiter as char,
            has_header,
            headers.len()
        );

        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(Cursor::new(sample).chain(buffered));

        let mut buffer = ByteRecord::new();
        if has_header {
            // Consume the header row.
            reader.read_byte_record(&mut buffer).map_err(csv_error)?;
        }

        Ok(Self {
            reader,
            headers,
            source_names,
            delimiter,
            column_tolerance: config.column_tolerance,
            null_tokens: config.null_tokens.clone(),
            position: 0,
            entity,
            estimated_total: None,
            avg_row_bytes,
            has_header,
            bom_len,
            buffer,
        })
    }

    /// Detected (or configured) delimiter.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    fn estimate_from_size(&mut self, size: u64) {
        if let Some(avg) = self.avg_row_bytes.filter(|a| *a > 0) {
            let rows = size / avg;
            self.estimated_total = Some(rows.saturating_sub(u64::from(self.has_header)));
        }
    }

    fn provenance(&self) -> Provenance {
        let mut p = Provenance::at(self.position);
        if let Some(pos) = self.buffer.position() {
            p = p.with_line(pos.line()).with_offset(pos.byte() + self.bom_len);
        }
        if let Some(ref entity) = self.entity {
            p = p.with_entity(entity.clone());
        }
        p
    }

    fn convert(&self, raw: &[u8], provenance: &Provenance) -> Result<Option<String>> {
        let value = std::str::from_utf8(raw).map_err(|e| {
            MigrateError::decode(format!("invalid UTF-8: {}", e), provenance.clone())
        })?;
        if self.null_tokens.iter().any(|t| t == value) {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }
}

impl<R: Read + Send> Decoder for TabularDecoder<R> {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Tabular
    }

    fn header_names(&self) -> &[String] {
        &self.headers
    }

    fn source_names(&self) -> &[String] {
        &self.source_names
    }

    fn entity_hint(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        match self.reader.read_byte_record(&mut self.buffer) {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) if e.is_io_error() => return Err(csv_error(e)),
            Err(e) => {
                let provenance = self.provenance();
                self.position += 1;
                return Err(MigrateError::decode(e.to_string(), provenance));
            }
        }

        let provenance = self.provenance();
        self.position += 1;

        let expected = self.headers.len();
        let got = self.buffer.len();
        if got != expected {
            let diff = expected.abs_diff(got);
            match self.column_tolerance {
                Some(tolerance) if diff > tolerance => {
                    return Err(MigrateError::decode(
                        format!(
                            "expected {} column(s), found {} (tolerance {})",
                            expected, got, tolerance
                        ),
                        provenance,
                    ));
                }
                _ => debug!(
                    "{}: {} column(s) instead of {}, padding/truncating",
                    provenance, got, expected
                ),
            }
        }

        let mut fields = Vec::with_capacity(expected);
        for (i, name) in self.headers.iter().enumerate() {
            let value = match self.buffer.get(i) {
                Some(raw) => self.convert(raw, &provenance)?,
                None => None,
            };
            fields.push((name.clone(), value));
        }

        Ok(Some(Record::from_pairs(fields, provenance)))
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn estimated_total(&self) -> Option<u64> {
        self.estimated_total
    }
}

/// Parse sampled bytes into rows; unparseable rows are dropped.
fn parse_rows(sample: &[u8], delimiter: u8) -> Vec<Vec<String>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(sample);
    reader
        .byte_records()
        .filter_map(|r| r.ok())
        .map(|r| {
            r.iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect()
        })
        .collect()
}

fn csv_error(e: csv::Error) -> MigrateError {
    if e.is_io_error() {
        MigrateError::Io(std::io::Error::from(e))
    } else {
        warn!("CSV parse error: {}", e);
        MigrateError::decode(e.to_string(), Provenance::at(0))
    }
}

impl<R: Read> std::fmt::Debug for TabularDecoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabularDecoder")
            .field("delimiter", &(self.delimiter as char))
            .field("headers", &self.headers)
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode<'a>(input: &'a str, config: &DecoderConfig) -> TabularDecoder<&'a [u8]> {
        TabularDecoder::from_reader(input.as_bytes(), config, Some("people".into())).unwrap()
    }

    #[test]
    fn test_detect_comma() {
        let lines = ["id,name,email", "1,Ann,a@x.com", "2,Bo,b@x.com"];
        assert_eq!(detect_delimiter(&lines), b',');
    }

    #[test]
    fn test_detect_semicolon_over_inconsistent_commas() {
        let lines = [
            "id;name;note",
            "1;Ann;hello, world",
            "2;Bo;a, b, c",
            "3;Cy;plain",
        ];
        assert_eq!(detect_delimiter(&lines), b';');
    }

    #[test]
    fn test_detect_ignores_quoted_delimiters() {
        let lines = ["a\tb", "\"x\tq\"\ty", "1\t2"];
        assert_eq!(detect_delimiter(&lines), b'\t');
    }

    #[test]
    fn test_detect_falls_back_to_comma() {
        let lines = ["justoneword", "another"];
        assert_eq!(detect_delimiter(&lines), b',');
    }

    #[test]
    fn test_header_detected_by_type_contrast() {
        let mut d = decode("id,name\n1,Ann\n2,Bo\n", &DecoderConfig::default());
        assert_eq!(d.header_names(), &["id".to_string(), "name".to_string()]);
        let r = d.next_record().unwrap().unwrap();
        assert_eq!(r.get("id"), Some("1"));
        assert_eq!(r.provenance().entity.as_deref(), Some("people"));
    }

    #[test]
    fn test_no_header_generates_column_names() {
        let mut d = decode("1,2\n3,4\n", &DecoderConfig::default());
        assert_eq!(
            d.header_names(),
            &["column_1".to_string(), "column_2".to_string()]
        );
        let r = d.next_record().unwrap().unwrap();
        assert_eq!(r.get("column_2"), Some("2"));
    }

    #[test]
    fn test_header_only_file_has_no_records() {
        let mut d = decode("id,name\n", &DecoderConfig::default());
        assert_eq!(d.header_names(), &["id".to_string(), "name".to_string()]);
        assert!(d.next_record().unwrap().is_none());
        assert_eq!(d.position(), 0);
    }

    #[test]
    fn test_single_data_row_is_not_a_header() {
        let mut d = decode("7,Ann\n", &DecoderConfig::default());
        assert_eq!(d.header_names()[0], "column_1");
        assert_eq!(d.next_record().unwrap().unwrap().get("column_2"), Some("Ann"));
    }

    #[test]
    fn test_header_names_normalized_and_unique() {
        let d = decode("First Name,first name,Age\nAnn,Ann,3\n", &DecoderConfig::default());
        assert_eq!(
            d.header_names(),
            &[
                "first_name".to_string(),
                "first_name_2".to_string(),
                "age".to_string()
            ]
        );
        assert_eq!(d.source_names()[0], "First Name");
    }

    #[test]
    fn test_null_tokens_and_padding() {
        let mut d = decode("a,b,c\nNULL,\\N,x\n1\n", &DecoderConfig::default());
        let r = d.next_record().unwrap().unwrap();
        assert_eq!(r.get("a"), None);
        assert_eq!(r.get("b"), None);
        assert_eq!(r.get("c"), Some("x"));

        let r = d.next_record().unwrap().unwrap();
        assert_eq!(r.get("a"), Some("1"));
        assert!(r.contains("c"));
        assert_eq!(r.get("c"), None);
    }

    #[test]
    fn test_column_tolerance_exceeded() {
        let config = DecoderConfig {
            column_tolerance: Some(0),
            has_header: Some(true),
            ..DecoderConfig::default()
        };
        let mut d = decode("a,b\n1,2,3\n4,5\n", &config);
        let err = d.next_record().unwrap_err();
        match err {
            MigrateError::Decode { provenance, .. } => assert_eq!(provenance.record_number, 0),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(d.position(), 1);
        let r = d.next_record().unwrap().unwrap();
        assert_eq!(r.get("b"), Some("5"));
    }

    #[test]
    fn test_streams_beyond_sample_window() {
        let mut input = String::from("n\n");
        for i in 0..100 {
            input.push_str(&format!("{}\n", i));
        }
        let config = DecoderConfig {
            sample_lines: 3,
            ..DecoderConfig::default()
        };
        let mut d = decode(&input, &config);
        let all: Vec<_> = d.records().collect::<Result<_>>().unwrap();
        assert_eq!(all.len(), 100);
        assert_eq!(all[99].get("n"), Some("99"));
    }

    #[test]
    fn test_bom_stripped() {
        let d = decode("\u{feff}id,name\n1,Ann\n", &DecoderConfig::default());
        assert_eq!(d.header_names()[0], "id");
    }

    #[test]
    fn test_semicolon_file() {
        let mut d = decode("id;city\n1;Paris\n2;Oslo\n", &DecoderConfig::default());
        assert_eq!(d.delimiter(), b';');
        let r = d.next_record().unwrap().unwrap();
        assert_eq!(r.get("city"), Some("Paris"));
    }
}
