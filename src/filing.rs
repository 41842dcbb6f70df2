// 🧾 Filing Record - one line of a quarterly accounting filing
//
// Required fields are explicit struct members; anything else the source file
// carries lands in `extra` so schema drift never breaks the reader.

use crate::period::Period;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sentinel stored in place of a required field that was empty in the source.
/// Key fields carry it as a prefix of a per-row placeholder, see
/// [`FilingRecord::missing_key`].
pub const MISSING: &str = "MISSING";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilingRecord {
    // ========================================================================
    // KEY (registry_id, account_code, period) - unique in the store
    // ========================================================================
    pub registry_id: String,
    pub account_code: String,
    pub period: Period,

    // ========================================================================
    // VALUES
    // ========================================================================
    pub description: String,
    pub opening_balance: Option<f64>,
    pub closing_balance: Option<f64>,

    /// Raw embedded date, if the file had one
    #[serde(default)]
    pub date: Option<String>,

    // ========================================================================
    // PROVENANCE
    // ========================================================================
    pub source_file: String,
    pub line_number: usize,

    /// Columns not mapped to a field above
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl FilingRecord {
    /// Closing minus opening; absent when either balance is missing
    pub fn delta(&self) -> Option<f64> {
        match (self.opening_balance, self.closing_balance) {
            (Some(open), Some(close)) => Some(close - open),
            _ => None,
        }
    }

    /// Ordering key used by the classifier and the writer
    pub fn sort_key(&self) -> (Period, &str, &str) {
        (self.period, &self.registry_id, &self.account_code)
    }

    /// Fields that are empty or hold the missing sentinel
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if is_blank(&self.registry_id) {
            missing.push("registry_id");
        }
        if is_blank(&self.account_code) {
            missing.push("account_code");
        }
        if is_blank(&self.description) {
            missing.push("description");
        }
        missing
    }

    /// Placeholder for a blank key field: `MISSING:<source_file>:<line>`.
    /// Unique per source row, so two incomplete rows never share a store key.
    pub fn missing_key(&self) -> String {
        format!("{}:{}:{}", MISSING, self.source_file, self.line_number)
    }

    /// Replace blank required fields with the sentinel, returning what changed
    pub fn apply_missing_sentinels(&mut self) -> Vec<&'static str> {
        let missing = self.missing_required_fields();
        for field in &missing {
            match *field {
                "registry_id" => self.registry_id = self.missing_key(),
                "account_code" => self.account_code = self.missing_key(),
                "description" => self.description = MISSING.to_string(),
                _ => {}
            }
        }
        missing
    }
}

fn is_blank(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v.starts_with(MISSING) || v.eq_ignore_ascii_case("nan") || v.eq_ignore_ascii_case("none")
}

// ============================================================================
// NUMERIC PARSING
// ============================================================================

/// Parse a balance as published by the portal.
///
/// Values containing a comma are read in Brazilian notation ("1.234,56");
/// everything else as a plain decimal ("1234.56"). Empty means absent.
pub fn parse_amount(raw: &str) -> Result<Option<f64>, String> {
    let text = raw.trim().trim_matches('"');
    if text.is_empty() {
        return Ok(None);
    }

    let normalized = if text.contains(',') {
        text.replace('.', "").replace(',', ".")
    } else {
        text.to_string()
    };

    normalized
        .parse::<f64>()
        .map(Some)
        .map_err(|e| format!("invalid amount '{}': {}", raw, e))
}

/// Sum of deltas over records that have one
pub fn total_delta(records: &[FilingRecord]) -> f64 {
    records.iter().filter_map(|r| r.delta()).sum()
}
