// ✅ Validation Issues & Audit Report
//
// Every non-fatal problem found while reading, loading, resolving or
// classifying becomes an immutable ValidationIssue. Issues are collected in a
// single AuditReport instead of being raised one by one, so a bad record never
// halts a batch.

use crate::error::Result;
use crate::period::Period;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// ============================================================================
// REASON CODES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Required field empty; record stored with the missing sentinel
    MissingRequiredField,
    /// Balance could not be parsed as a number
    UnparsableNumber,
    /// Line skipped by the reader (wrong column count / malformed)
    MalformedLine,
    /// No candidate encoding produced a table
    DecodeFailed,
    /// File format the reader does not handle
    UnsupportedFormat,
    /// File name and embedded date disagree on the period
    PeriodMismatch,
    /// Neither file name nor content yields a period
    UnknownPeriod,
    /// File has no claims-expense line at all
    NoClaimsLines,
    /// Batch insert failed; retried on the next run
    BatchInsertFailed,
    /// Registry id absent from the registry
    OperatorNotFound,
    /// Registry id ambiguous in the registry
    OperatorConflict,
    /// Tax identifier fails format or check digits
    InvalidTaxId,
    /// Claims value with an unexpected sign
    SuspiciousSign,
    /// Registry feed could not be loaded
    RegistryUnavailable,
    /// Portal payload could not be fetched or opened
    FetchFailed,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            ReasonCode::UnparsableNumber => "UNPARSABLE_NUMBER",
            ReasonCode::MalformedLine => "MALFORMED_LINE",
            ReasonCode::DecodeFailed => "DECODE_FAILED",
            ReasonCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ReasonCode::PeriodMismatch => "PERIOD_MISMATCH",
            ReasonCode::UnknownPeriod => "UNKNOWN_PERIOD",
            ReasonCode::NoClaimsLines => "NO_CLAIMS_LINES",
            ReasonCode::BatchInsertFailed => "BATCH_INSERT_FAILED",
            ReasonCode::OperatorNotFound => "OPERATOR_NOT_FOUND",
            ReasonCode::OperatorConflict => "OPERATOR_CONFLICT",
            ReasonCode::InvalidTaxId => "INVALID_TAX_ID",
            ReasonCode::SuspiciousSign => "SUSPICIOUS_SIGN",
            ReasonCode::RegistryUnavailable => "REGISTRY_UNAVAILABLE",
            ReasonCode::FetchFailed => "FETCH_FAILED",
        }
    }
}

// ============================================================================
// VALIDATION ISSUE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub source_file: String,
    pub line: Option<usize>,
    pub fields: Vec<String>,
    pub reason: ReasonCode,
    pub detail: String,
    pub registry_id: Option<String>,
    pub period: Option<Period>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationIssue {
    pub fn new(source_file: &str, reason: ReasonCode, detail: impl Into<String>) -> Self {
        ValidationIssue {
            source_file: source_file.to_string(),
            line: None,
            fields: Vec::new(),
            reason,
            detail: detail.into(),
            registry_id: None,
            period: None,
            timestamp: Utc::now(),
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn for_filing(mut self, registry_id: &str, period: Period) -> Self {
        self.registry_id = Some(registry_id.to_string());
        self.period = Some(period);
        self
    }
}

// ============================================================================
// AUDIT REPORT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditReport {
    issues: Vec<ValidationIssue>,
}

impl AuditReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, issue: ValidationIssue) {
        debug!(
            reason = issue.reason.as_str(),
            file = %issue.source_file,
            line = ?issue.line,
            "{}",
            issue.detail
        );
        self.issues.push(issue);
    }

    pub fn extend(&mut self, issues: impl IntoIterator<Item = ValidationIssue>) {
        for issue in issues {
            self.record(issue);
        }
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, reason: ReasonCode) -> usize {
        self.issues.iter().filter(|i| i.reason == reason).count()
    }

    /// Issue counts per reason code, most frequent first
    pub fn counts_by_reason(&self) -> Vec<(ReasonCode, usize)> {
        let mut counts: BTreeMap<ReasonCode, usize> = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.reason).or_insert(0) += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        counts
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "AUDIT SUMMARY - generated {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(out, "{}", "=".repeat(60));
        let _ = writeln!(out, "Total issues: {}", self.issues.len());
        let _ = writeln!(out);
        let _ = writeln!(out, "Issues by reason:");
        let _ = writeln!(out, "{}", "-".repeat(60));
        for (reason, count) in self.counts_by_reason() {
            let _ = writeln!(out, "  {:>6}x - {}", count, reason.as_str());
        }
        out
    }

    /// Write `audit_issues.csv` and `audit_summary.txt` into `dir`
    pub fn write_to_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;

        let csv_path = dir.join("audit_issues.csv");
        let mut wtr = crate::writer::bom_csv_writer(&csv_path, b';')?;
        wtr.write_record([
            "timestamp",
            "source_file",
            "line",
            "fields",
            "reason",
            "registry_id",
            "period",
            "detail",
        ])?;
        for issue in &self.issues {
            wtr.write_record([
                issue.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                issue.source_file.clone(),
                issue.line.map(|l| l.to_string()).unwrap_or_default(),
                issue.fields.join(","),
                issue.reason.as_str().to_string(),
                issue.registry_id.clone().unwrap_or_default(),
                issue.period.map(|p| p.marker()).unwrap_or_default(),
                issue.detail.clone(),
            ])?;
        }
        wtr.flush()?;

        let summary_path = dir.join("audit_summary.txt");
        std::fs::write(&summary_path, self.summary())?;

        info!(issues = self.issues.len(), path = %csv_path.display(), "Audit report written");
        Ok(vec![csv_path, summary_path])
    }
}

// ============================================================================
// TAX IDENTIFIER (CNPJ)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TaxIdCheck {
    /// 14 digits when recoverable
    pub normalized: Option<String>,
    pub format_ok: bool,
    pub check_digits_ok: bool,
}

impl TaxIdCheck {
    pub fn is_valid(&self) -> bool {
        self.check_digits_ok
    }
}

/// Validate a CNPJ: formatting, all-equal digits, and both mod-11 check digits.
/// Inputs with 1..13 digits are left-padded with zeros before checking.
pub fn check_tax_id(raw: &str) -> TaxIdCheck {
    let text = raw.trim();
    let format_ok = is_formatted_cnpj(text) || (text.len() == 14 && text.bytes().all(|b| b.is_ascii_digit()));

    let mut digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if (1..=13).contains(&digits.len()) {
        digits = format!("{:0>14}", digits);
    }
    if digits.len() != 14 {
        return TaxIdCheck {
            normalized: None,
            format_ok,
            check_digits_ok: false,
        };
    }

    let values: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();
    let all_equal = values.iter().all(|d| *d == values[0]);
    let check_digits_ok = !all_equal && verify_check_digits(&values);

    TaxIdCheck {
        normalized: Some(digits),
        format_ok,
        check_digits_ok,
    }
}

fn is_formatted_cnpj(text: &str) -> bool {
    // NN.NNN.NNN/NNNN-NN
    let bytes = text.as_bytes();
    if bytes.len() != 18 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        2 | 6 => *b == b'.',
        10 => *b == b'/',
        15 => *b == b'-',
        _ => b.is_ascii_digit(),
    })
}

fn verify_check_digits(d: &[u32]) -> bool {
    const W1: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    const W2: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

    let digit = |sum: u32| {
        let rest = sum % 11;
        if rest < 2 {
            0
        } else {
            11 - rest
        }
    };

    let dv1 = digit(W1.iter().zip(d).map(|(w, x)| w * x).sum());
    if dv1 != d[12] {
        return false;
    }
    let dv2 = digit(W2.iter().zip(d).map(|(w, x)| w * x).sum());
    dv2 == d[13]
}
