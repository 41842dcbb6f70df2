// ⚖️ Value Reconciliation - raw input vs stored vs published totals
//
// Following the chain:
//   raw deltas read this run  →  deltas stored  →  deltas in all_filings.csv
//
// Mismatches are reported, never corrected. A resumed run only re-reads the
// files it still had to load, so its raw total covers part of the input.

use serde::{Deserialize, Serialize};

/// Differences below this are rounding noise
pub const TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    Balanced,
    /// Raw input and store disagree (duplicate keys or rejected batches)
    InputMismatch { difference: f64, percentage: f64 },
    /// Store and published table disagree
    OutputMismatch { difference: f64, percentage: f64 },
    /// Raw total covers only the files loaded in this run
    Partial,
}

impl ReconciliationResult {
    pub fn is_balanced(&self) -> bool {
        matches!(self, ReconciliationResult::Balanced)
    }

    pub fn difference(&self) -> f64 {
        match self {
            ReconciliationResult::InputMismatch { difference, .. }
            | ReconciliationResult::OutputMismatch { difference, .. } => *difference,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueReconciliation {
    pub raw_total: f64,
    pub stored_total: f64,
    pub output_total: f64,
    /// Sum of the "with deductions" view
    pub claims_total: f64,
    pub result: ReconciliationResult,
}

impl ValueReconciliation {
    pub fn new(raw_total: f64, stored_total: f64, output_total: f64, claims_total: f64, partial_input: bool) -> Self {
        let result = if (stored_total - output_total).abs() > TOLERANCE {
            let difference = output_total - stored_total;
            ReconciliationResult::OutputMismatch {
                difference,
                percentage: percentage(difference, stored_total),
            }
        } else if partial_input {
            ReconciliationResult::Partial
        } else if (raw_total - stored_total).abs() > TOLERANCE {
            let difference = stored_total - raw_total;
            ReconciliationResult::InputMismatch {
                difference,
                percentage: percentage(difference, raw_total),
            }
        } else {
            ReconciliationResult::Balanced
        };

        ValueReconciliation {
            raw_total,
            stored_total,
            output_total,
            claims_total,
            result,
        }
    }

    pub fn summary(&self) -> String {
        let status = match &self.result {
            ReconciliationResult::Balanced => "balanced".to_string(),
            ReconciliationResult::Partial => "partial input (resumed run)".to_string(),
            ReconciliationResult::InputMismatch { difference, percentage } => {
                format!("input mismatch {:.2} ({:.4}%)", difference, percentage)
            }
            ReconciliationResult::OutputMismatch { difference, percentage } => {
                format!("output mismatch {:.2} ({:.4}%)", difference, percentage)
            }
        };
        format!(
            "raw {:.2} | stored {:.2} | output {:.2} | claims {:.2} → {}",
            self.raw_total, self.stored_total, self.output_total, self.claims_total, status
        )
    }
}

fn percentage(difference: f64, base: f64) -> f64 {
    if base.abs() < f64::EPSILON {
        0.0
    } else {
        difference / base * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_within_tolerance() {
        let r = ValueReconciliation::new(1000.0, 1000.004, 1000.004, 800.0, false);
        assert!(r.result.is_balanced());
    }

    #[test]
    fn test_duplicate_input_shows_as_input_mismatch() {
        let r = ValueReconciliation::new(1200.0, 1000.0, 1000.0, 1000.0, false);
        match r.result {
            ReconciliationResult::InputMismatch { difference, percentage } => {
                assert_eq!(difference, -200.0);
                assert!((percentage + 16.6667).abs() < 1e-3);
            }
            other => panic!("expected input mismatch, got {:?}", other),
        }
        assert!(r.summary().contains("input mismatch"));
    }

    #[test]
    fn test_partial_and_output_mismatch() {
        let partial = ValueReconciliation::new(10.0, 1000.0, 1000.0, 0.0, true);
        assert_eq!(partial.result, ReconciliationResult::Partial);

        let broken = ValueReconciliation::new(1000.0, 1000.0, 990.0, 0.0, true);
        assert_eq!(broken.result.difference(), -10.0);
    }
}
