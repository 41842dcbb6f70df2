// 📖 Encoding-Resilient Record Reader
//
// Raw portal files arrive in whatever encoding the publisher used that quarter.
// Candidate decoders are tried in a fixed order, most likely first; the first
// one that yields a table with a stable column count wins. Malformed lines are
// skipped, never fatal. Afterwards, text that was double-encoded upstream
// ("SaÃºde") is repaired on a best-effort basis.

use crate::error::{ConsolidationError, Result};
use crate::filing::{parse_amount, FilingRecord};
use crate::period::{parse_embedded_date, Period};
use crate::validation::{ReasonCode, ValidationIssue};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::{debug, warn};

// ============================================================================
// COLUMN ALIASES
// ============================================================================

pub const REGISTRY_ID_COLUMNS: &[&str] = &["REG_ANS", "REGISTRO_OPERADORA", "REGISTRO_ANS"];
pub const ACCOUNT_CODE_COLUMNS: &[&str] = &["CD_CONTA_CONTABIL"];
pub const DESCRIPTION_COLUMNS: &[&str] = &["DESCRICAO"];
pub const OPENING_BALANCE_COLUMNS: &[&str] = &["VL_SALDO_INICIAL", "SALDO_INICIAL"];
pub const CLOSING_BALANCE_COLUMNS: &[&str] = &["VL_SALDO_FINAL", "SALDO_FINAL"];
pub const DATE_COLUMNS: &[&str] = &["DATA", "DATA_INICIO", "DATA_TRIMESTRE"];

/// Decoders tried in order. Latin-1 and ISO-8859-1 labels both resolve to
/// windows-1252 in the WHATWG encoding standard, and windows-1252 maps every
/// byte, so nothing after it could ever be reached.
pub fn candidate_encodings() -> [&'static Encoding; 2] {
    [UTF_8, WINDOWS_1252]
}

// ============================================================================
// DECODED TABLE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    /// 1-based line in the source file
    pub line: usize,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DecodedTable {
    pub encoding: &'static str,
    /// Normalized: upper-cased, trimmed, spaces replaced with '_'
    pub headers: Vec<String>,
    pub rows: Vec<TableRow>,
    pub skipped_lines: Vec<usize>,
}

impl DecodedTable {
    /// Index of the first header matching one of the aliases
    pub fn column(&self, aliases: &[&str]) -> Option<usize> {
        aliases
            .iter()
            .find_map(|alias| self.headers.iter().position(|h| h == alias))
    }

    /// Trimmed cell value, empty string when out of range
    pub fn cell<'a>(&self, row: &'a TableRow, column: Option<usize>) -> &'a str {
        column
            .and_then(|c| row.fields.get(c))
            .map(|s| s.trim())
            .unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .to_uppercase()
        .replace(' ', "_")
}

// ============================================================================
// DECODING
// ============================================================================

/// Decode `bytes` into a table, trying each candidate encoding in order.
pub fn read_table(bytes: &[u8], separator: u8, source_name: &str) -> Result<DecodedTable> {
    let mut tried = Vec::new();

    for encoding in candidate_encodings() {
        tried.push(encoding.name());

        let Some(text) = decode_strict(bytes, encoding) else {
            debug!(file = source_name, encoding = encoding.name(), "Decode failed, trying next encoding");
            continue;
        };

        match parse_table(&text, separator, encoding.name()) {
            Some(table) => {
                debug!(
                    file = source_name,
                    encoding = table.encoding,
                    rows = table.rows.len(),
                    skipped = table.skipped_lines.len(),
                    "File decoded"
                );
                return Ok(table);
            }
            None => {
                debug!(file = source_name, encoding = encoding.name(), "No stable table, trying next encoding");
            }
        }
    }

    warn!(file = source_name, "No candidate encoding produced a parseable table");
    Err(ConsolidationError::Decode {
        source_name: source_name.to_string(),
        tried: tried.join(", "),
    })
}

fn decode_strict(bytes: &[u8], encoding: &'static Encoding) -> Option<String> {
    let body = if encoding == UTF_8 {
        bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes)
    } else {
        bytes
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .map(Cow::into_owned)
}

fn parse_table(text: &str, separator: u8, encoding: &'static str) -> Option<DecodedTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(separator)
        .quote(b'"')
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = rdr
        .headers()
        .ok()?
        .iter()
        .map(|h| normalize_header(&repair_double_encoding(h)))
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return None;
    }

    let width = headers.len();
    let mut rows = Vec::new();
    let mut skipped_lines = Vec::new();

    for (idx, result) in rdr.records().enumerate() {
        match result {
            Ok(record) => {
                let line = record
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(idx + 2);
                if record.len() != width {
                    skipped_lines.push(line);
                    continue;
                }
                rows.push(TableRow {
                    line,
                    fields: record
                        .iter()
                        .map(|f| repair_double_encoding(f).into_owned())
                        .collect(),
                });
            }
            Err(e) => {
                let line = e.position().map(|p| p.line() as usize).unwrap_or(idx + 2);
                skipped_lines.push(line);
            }
        }
    }

    // Stable column count: most data lines agree with the header
    if skipped_lines.len() > rows.len() {
        return None;
    }

    Some(DecodedTable {
        encoding,
        headers,
        rows,
        skipped_lines,
    })
}

/// Undo UTF-8 text that was read as windows-1252 and re-encoded ("SaÃºde").
/// Returns the input unchanged when the round trip is not clean.
pub fn repair_double_encoding(text: &str) -> Cow<'_, str> {
    if !text.chars().any(|c| matches!(c, 'Ã' | 'Â')) {
        return Cow::Borrowed(text);
    }

    let (bytes, _, had_errors) = WINDOWS_1252.encode(text);
    if had_errors {
        return Cow::Borrowed(text);
    }
    match std::str::from_utf8(&bytes) {
        Ok(repaired) => Cow::Owned(repaired.to_string()),
        Err(_) => Cow::Borrowed(text),
    }
}

// ============================================================================
// TYPED EXTRACTION
// ============================================================================

/// Period from the first row carrying a parseable embedded date
pub fn embedded_period(table: &DecodedTable) -> Option<Period> {
    let columns: Vec<usize> = DATE_COLUMNS
        .iter()
        .filter_map(|c| table.column(&[c]))
        .collect();
    if columns.is_empty() {
        return None;
    }

    table.rows.iter().find_map(|row| {
        columns
            .iter()
            .find_map(|c| parse_embedded_date(table.cell(row, Some(*c))))
            .map(Period::from_date)
    })
}

/// Turn decoded rows into typed filing records.
///
/// Nothing is dropped here: unparsable balances become absent values and are
/// reported. Required-field checks happen in the batch loader.
pub fn extract_filings(
    table: &DecodedTable,
    source_file: &str,
    period: Period,
) -> (Vec<FilingRecord>, Vec<ValidationIssue>) {
    let reg = table.column(REGISTRY_ID_COLUMNS);
    let account = table.column(ACCOUNT_CODE_COLUMNS);
    let desc = table.column(DESCRIPTION_COLUMNS);
    let opening = table.column(OPENING_BALANCE_COLUMNS);
    let closing = table.column(CLOSING_BALANCE_COLUMNS);
    let date = table.column(DATE_COLUMNS);
    let mapped = [reg, account, desc, opening, closing, date];

    let mut issues: Vec<ValidationIssue> = table
        .skipped_lines
        .iter()
        .map(|line| {
            ValidationIssue::new(source_file, ReasonCode::MalformedLine, "line skipped: column count mismatch")
                .at_line(*line)
        })
        .collect();

    let mut records = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let mut amount = |column: Option<usize>, field: &str| -> Option<f64> {
            match parse_amount(table.cell(row, column)) {
                Ok(v) => v,
                Err(reason) => {
                    issues.push(
                        ValidationIssue::new(source_file, ReasonCode::UnparsableNumber, reason)
                            .at_line(row.line)
                            .with_fields(&[field]),
                    );
                    None
                }
            }
        };
        let opening_balance = amount(opening, "opening_balance");
        let closing_balance = amount(closing, "closing_balance");

        let extra: BTreeMap<String, String> = table
            .headers
            .iter()
            .enumerate()
            .filter(|(i, h)| !mapped.contains(&Some(*i)) && !h.is_empty())
            .map(|(i, h)| (h.clone(), row.fields[i].trim().to_string()))
            .collect();

        let date_value = table.cell(row, date);

        records.push(FilingRecord {
            registry_id: table.cell(row, reg).to_string(),
            account_code: table.cell(row, account).to_string(),
            period,
            description: table.cell(row, desc).to_string(),
            opening_balance,
            closing_balance,
            date: (!date_value.is_empty()).then(|| date_value.to_string()),
            source_file: source_file.to_string(),
            line_number: row.line,
            extra,
        });
    }

    (records, issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "DATA;REG_ANS;CD_CONTA_CONTABIL;DESCRICAO;VL_SALDO_INICIAL;VL_SALDO_FINAL\n";

    #[test]
    fn test_reads_utf8_with_bom() {
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice(HEADER.as_bytes());
        bytes.extend_from_slice("2025-01-01;123456;411111111;Despesas com Eventos / Sinistros;0;100,50\n".as_bytes());

        let table = read_table(&bytes, b';', "1T2025.csv").unwrap();
        assert_eq!(table.encoding, "UTF-8");
        assert_eq!(table.headers[0], "DATA");
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn test_falls_back_to_windows_1252() {
        let mut bytes = HEADER.as_bytes().to_vec();
        // "Saúde" in latin-1: 0xFA is not valid UTF-8 on its own
        bytes.extend_from_slice(b"2025-01-01;123456;311111111;Sa\xFAde;0;1\n");

        let table = read_table(&bytes, b';', "1T2025.csv").unwrap();
        assert_eq!(table.encoding, "windows-1252");
        assert_eq!(table.rows[0].fields[3], "Saúde");
    }

    #[test]
    fn test_skips_malformed_lines() {
        let text = format!(
            "{}2025-01-01;1;411111111;A;0;1\nbroken;line\n2025-01-01;2;411111111;B;0;2\n",
            HEADER
        );
        let table = read_table(text.as_bytes(), b';', "x.csv").unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.skipped_lines, vec![3]);
    }

    #[test]
    fn test_decode_error_when_nothing_parses() {
        let err = read_table(b"", b';', "empty.csv").unwrap_err();
        assert!(matches!(err, ConsolidationError::Decode { .. }));

        let text = "A;B;C\n1\n2\n3;4\n";
        assert!(read_table(text.as_bytes(), b';', "bad.csv").is_err());
    }

    #[test]
    fn test_fallback_order() {
        let names: Vec<&str> = candidate_encodings().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["UTF-8", "windows-1252"]);

        // Valid in both: UTF-8 is tried first and wins
        let text = format!("{}2025-01-01;1;411111111;Saúde;0;1\n", HEADER);
        assert_eq!(read_table(text.as_bytes(), b';', "a.csv").unwrap().encoding, "UTF-8");

        // Unstable shape under every decoder: all candidates are reported
        match read_table(b"A;B;C\n1\n2\n", b';', "bad.csv") {
            Err(ConsolidationError::Decode { tried, .. }) => assert_eq!(tried, "UTF-8, windows-1252"),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_repair_double_encoding() {
        assert_eq!(repair_double_encoding("SaÃºde"), "Saúde");
        assert_eq!(repair_double_encoding("Saúde"), "Saúde");
        assert!(matches!(repair_double_encoding("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_extract_filings_typed() {
        let text = format!(
            "{}2025-01-01;123456;411111111;Despesas com Eventos / Sinistros;1.000,00;1.500,25\n\
             2025-01-01;123456;411111112;- Glosas;xx;-10\n",
            HEADER.replace("VL_SALDO_FINAL", "VL SALDO FINAL;EXTRA COL").trim_end().to_string() + "\n"
        )
        .replace("1.500,25\n", "1.500,25;a\n")
        .replace("-10\n", "-10;b\n");

        let table = read_table(text.as_bytes(), b';', "1T2025.csv").unwrap();
        let period = Period::new(2025, 1).unwrap();
        let (records, issues) = extract_filings(&table, "1T2025.csv", period);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].delta(), Some(500.25));
        assert_eq!(records[0].extra.get("EXTRA_COL").map(String::as_str), Some("a"));
        assert_eq!(records[1].opening_balance, None);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].reason, ReasonCode::UnparsableNumber);
        assert_eq!(embedded_period(&table), Some(period));
    }
}
