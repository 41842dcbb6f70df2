// 🏷️ Claims Classifier - ordered scan for claims-expense lines
//
// Input is sorted by (period, registry id, account code); the scan depends on
// that order. A primary line matches the claims keywords and has a 9-digit
// account code starting with '4'. Every record immediately after it whose
// description starts with a negation marker and whose code has the same
// length is a deduction; the chain ends at the first record that is not.
// Zero-valued rows are dropped only after the scan.

use crate::filing::FilingRecord;
use crate::registry::ResolvedFiling;
use crate::validation::{ReasonCode, ValidationIssue};
use tracing::{debug, info};

pub const DEFAULT_KEYWORDS: &[&str] = &["despesas com eventos", "sinistros"];
pub const DEFAULT_NEGATION_MARKERS: &[&str] = &["(-)", "-"];
pub const ACCOUNT_CODE_LENGTH: usize = 9;
pub const ACCOUNT_LEADING_DIGIT: char = '4';

/// Anything that carries a filing record can be classified
pub trait AsFiling {
    fn filing(&self) -> &FilingRecord;
}

impl AsFiling for FilingRecord {
    fn filing(&self) -> &FilingRecord {
        self
    }
}

impl AsFiling for ResolvedFiling {
    fn filing(&self) -> &FilingRecord {
        &self.record
    }
}

// ============================================================================
// LINE ROLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRole {
    Primary,
    Deduction,
}

#[derive(Debug, Clone)]
pub struct ClaimsViews<T> {
    /// Primary lines followed by their deduction chains
    pub with_deductions: Vec<T>,
    /// Primary lines only
    pub without_deductions: Vec<T>,
    pub issues: Vec<ValidationIssue>,
}

// ============================================================================
// CLASSIFIER
// ============================================================================

pub struct ClaimsClassifier {
    keywords: Vec<String>,
    negation_markers: Vec<String>,
    code_length: usize,
    leading_digit: char,
}

impl ClaimsClassifier {
    pub fn new() -> Self {
        ClaimsClassifier {
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_lowercase()).collect(),
            negation_markers: DEFAULT_NEGATION_MARKERS.iter().map(|m| m.to_string()).collect(),
            code_length: ACCOUNT_CODE_LENGTH,
            leading_digit: ACCOUNT_LEADING_DIGIT,
        }
    }

    /// All keywords present, case-insensitive
    pub fn matches_keywords(&self, description: &str) -> bool {
        let text = description.to_lowercase();
        self.keywords.iter().all(|k| text.contains(k.as_str()))
    }

    fn code_has_length(&self, code: &str) -> bool {
        code.trim().chars().count() == self.code_length
    }

    pub fn is_primary(&self, rec: &FilingRecord) -> bool {
        self.matches_keywords(&rec.description)
            && self.code_has_length(&rec.account_code)
            && rec.account_code.trim().starts_with(self.leading_digit)
    }

    pub fn is_deduction(&self, rec: &FilingRecord) -> bool {
        let desc = rec.description.trim_start();
        self.negation_markers.iter().any(|m| desc.starts_with(m.as_str()))
            && self.code_has_length(&rec.account_code)
    }

    /// Roles in input order; None for unrelated records
    pub fn roles<T: AsFiling>(&self, records: &[T]) -> Vec<Option<LineRole>> {
        let mut roles = vec![None; records.len()];
        let mut i = 0;
        while i < records.len() {
            if !self.is_primary(records[i].filing()) {
                i += 1;
                continue;
            }
            roles[i] = Some(LineRole::Primary);
            let mut j = i + 1;
            while j < records.len() && self.is_deduction(records[j].filing()) {
                roles[j] = Some(LineRole::Deduction);
                j += 1;
            }
            i = j;
        }
        roles
    }

    /// Build both views. Input is re-sorted (stable) before the scan.
    pub fn classify<T: AsFiling + Clone>(&self, mut records: Vec<T>) -> ClaimsViews<T> {
        records.sort_by(|a, b| a.filing().sort_key().cmp(&b.filing().sort_key()));
        let roles = self.roles(&records);

        let mut views = ClaimsViews {
            with_deductions: Vec::new(),
            without_deductions: Vec::new(),
            issues: Vec::new(),
        };
        let mut zero_rows = 0;

        for (item, role) in records.into_iter().zip(roles) {
            let Some(role) = role else { continue };
            let rec = item.filing();
            let value = match rec.delta() {
                Some(v) if v != 0.0 => v,
                _ => {
                    zero_rows += 1;
                    continue;
                }
            };

            let suspicious = match role {
                LineRole::Primary => value < 0.0,
                LineRole::Deduction => value > 0.0,
            };
            if suspicious {
                views.issues.push(
                    ValidationIssue::new(
                        &rec.source_file,
                        ReasonCode::SuspiciousSign,
                        format!("{:?} line {} has value {:.2}", role, rec.account_code, value),
                    )
                    .at_line(rec.line_number)
                    .for_filing(&rec.registry_id, rec.period),
                );
            }

            if role == LineRole::Primary {
                views.without_deductions.push(item.clone());
            }
            views.with_deductions.push(item);
        }

        debug!(zero_rows, "Zero-valued classified rows dropped");
        info!(
            with_deductions = views.with_deductions.len(),
            without_deductions = views.without_deductions.len(),
            "Claims lines classified"
        );
        views
    }
}

impl Default for ClaimsClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filing::tests::filing;
    use crate::period::Period;

    const CLAIMS: &str = "Despesas com Eventos / Sinistros";

    fn q1() -> Period {
        Period::new(2025, 1).unwrap()
    }

    #[test]
    fn test_primary_with_deduction_chain() {
        let records = vec![
            filing("111111", "400000001", CLAIMS, 0.0, 1000.0, q1()),
            filing("111111", "400000002", "-X", 0.0, -100.0, q1()),
            filing("111111", "400000003", "-Y", 0.0, -50.0, q1()),
            filing("111111", "400000004", "Outras despesas", 0.0, 70.0, q1()),
        ];

        let views = ClaimsClassifier::new().classify(records);
        let with: Vec<&str> = views.with_deductions.iter().map(|r| r.account_code.as_str()).collect();
        let without: Vec<&str> = views.without_deductions.iter().map(|r| r.account_code.as_str()).collect();

        assert_eq!(with, vec!["400000001", "400000002", "400000003"]);
        assert_eq!(without, vec!["400000001"]);
        assert!(views.issues.is_empty());
    }

    #[test]
    fn test_chain_stops_at_first_non_deduction() {
        let records = vec![
            filing("111111", "411111111", CLAIMS, 0.0, 10.0, q1()),
            filing("111111", "411111112", "Receitas", 0.0, 5.0, q1()),
            filing("111111", "411111113", "(-) Recuperação", 0.0, -1.0, q1()),
        ];
        let views = ClaimsClassifier::new().classify(records);
        assert_eq!(views.with_deductions.len(), 1);
    }

    #[test]
    fn test_primary_requires_code_shape() {
        let c = ClaimsClassifier::new();
        assert!(c.is_primary(&filing("1", "411111111", CLAIMS, 0.0, 1.0, q1())));
        assert!(!c.is_primary(&filing("1", "311111111", CLAIMS, 0.0, 1.0, q1())));
        assert!(!c.is_primary(&filing("1", "41111111", CLAIMS, 0.0, 1.0, q1())));
        assert!(!c.is_primary(&filing("1", "411111111", "Despesas com Eventos", 0.0, 1.0, q1())));
        assert!(c.is_deduction(&filing("1", "411111112", "(-) Glosas", 0.0, 1.0, q1())));
        assert!(!c.is_deduction(&filing("1", "4111", "- Glosas", 0.0, 1.0, q1())));
    }

    #[test]
    fn test_zero_values_removed_after_scan() {
        // A zero primary still anchors its chain
        let records = vec![
            filing("111111", "411111111", CLAIMS, 5.0, 5.0, q1()),
            filing("111111", "411111112", "- Glosas", 10.0, 0.0, q1()),
        ];
        let views = ClaimsClassifier::new().classify(records);
        assert!(views.without_deductions.is_empty());
        assert_eq!(views.with_deductions.len(), 1);
        assert_eq!(views.with_deductions[0].account_code, "411111112");
    }

    #[test]
    fn test_input_is_sorted_before_scan() {
        let q2 = Period::new(2025, 2).unwrap();
        let records = vec![
            filing("111111", "411111112", "- Glosas", 0.0, -3.0, q1()),
            filing("111111", "411111111", CLAIMS, 0.0, 30.0, q2),
            filing("111111", "411111111", CLAIMS, 0.0, 10.0, q1()),
        ];
        let views = ClaimsClassifier::new().classify(records);
        let values: Vec<f64> = views.with_deductions.iter().filter_map(|r| r.delta()).collect();
        assert_eq!(values, vec![10.0, -3.0, 30.0]);
    }

    #[test]
    fn test_suspicious_signs_reported() {
        let records = vec![
            filing("111111", "411111111", CLAIMS, 100.0, 40.0, q1()),
            filing("111111", "411111112", "- Glosas", 0.0, 5.0, q1()),
        ];
        let views = ClaimsClassifier::new().classify(records);
        assert_eq!(views.issues.len(), 2);
        assert!(views.issues.iter().all(|i| i.reason == ReasonCode::SuspiciousSign));
    }
}
