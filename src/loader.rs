// 📦 Batch Loader - bounded, retry-safe insertion driven by the checkpoint
//
// Records are cut into fixed-size batches. A batch that the insert function
// confirms advances the checkpoint; a batch that fails (reported or raised)
// leaves the checkpoint where it was and stops the file, so the next run
// retries from the same offset. Failed batches are not added to the error
// tally. Records missing required fields are kept with a sentinel value and
// reported as validation issues. Processed counts follow what the store says
// it accepted, falling back to the batch size when it says nothing.

use crate::checkpoint::CheckpointStore;
use crate::error::Result;
use crate::filing::FilingRecord;
use crate::validation::{ReasonCode, ValidationIssue};
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// What the insert function reports for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Batch stored; optionally the number of rows the store accepted
    Inserted(Option<usize>),
    /// Batch rejected without an error being raised
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub file: String,
    pub batches: usize,
    pub processed: usize,
    pub errors: usize,
    /// Offset of the first unconfirmed batch when the file stopped early
    pub interrupted_at: Option<usize>,
    pub issues: Vec<ValidationIssue>,
}

impl BatchReport {
    pub fn completed(&self) -> bool {
        self.interrupted_at.is_none()
    }
}

pub struct BatchLoader {
    batch_size: usize,
}

impl BatchLoader {
    pub fn new(batch_size: usize) -> Self {
        BatchLoader {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Load `records[start_offset..]` for `file`.
    ///
    /// Offsets are positions in `records`, so resuming with the offset the
    /// checkpoint holds skips exactly the confirmed batches.
    pub fn load<F>(
        &self,
        file: &str,
        mut records: Vec<FilingRecord>,
        start_offset: usize,
        checkpoint: &CheckpointStore,
        mut insert: F,
    ) -> BatchReport
    where
        F: FnMut(&[FilingRecord]) -> Result<InsertOutcome>,
    {
        let mut report = BatchReport {
            file: file.to_string(),
            ..Default::default()
        };

        let total = records.len();
        if start_offset > 0 {
            info!(file, offset = start_offset, total, "Resuming file from checkpoint");
        }
        if start_offset >= total {
            return report;
        }

        let mut offset = start_offset;
        while offset < total {
            let end = (offset + self.batch_size).min(total);
            let batch = &mut records[offset..end];

            let mut batch_issues = Vec::new();
            for rec in batch.iter_mut() {
                let missing = rec.apply_missing_sentinels();
                if !missing.is_empty() {
                    batch_issues.push(
                        ValidationIssue::new(
                            &rec.source_file,
                            ReasonCode::MissingRequiredField,
                            format!("required field(s) empty: {}", missing.join(", ")),
                        )
                        .at_line(rec.line_number)
                        .with_fields(&missing)
                        .for_filing(&rec.registry_id, rec.period),
                    );
                }
            }

            match insert(&*batch) {
                Ok(InsertOutcome::Inserted(count)) => {
                    // The store's own count wins over the batch size
                    let accepted = count.unwrap_or(batch.len());
                    if accepted < batch.len() {
                        info!(file, offset, accepted, size = batch.len(), "Store accepted fewer rows than sent");
                    }
                    let batch_errors = batch_issues.len();
                    report.batches += 1;
                    report.processed += accepted;
                    report.errors += batch_errors;
                    report.issues.extend(batch_issues);
                    checkpoint.advance(file, end, accepted, batch_errors);
                    debug!(file, offset = end, accepted, "Batch confirmed");
                    offset = end;
                }
                Ok(InsertOutcome::Failed) => {
                    warn!(file, offset, "Batch insert reported failure, will retry on next run");
                    report.interrupted_at = Some(offset);
                    report.issues.push(batch_failure(file, offset, "insert reported failure"));
                    break;
                }
                Err(e) => {
                    warn!(file, offset, "Batch insert raised: {}, will retry on next run", e);
                    report.interrupted_at = Some(offset);
                    report.issues.push(batch_failure(file, offset, &e.to_string()));
                    break;
                }
            }
        }

        report
    }
}

impl Default for BatchLoader {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

fn batch_failure(file: &str, offset: usize, detail: &str) -> ValidationIssue {
    ValidationIssue::new(
        file,
        ReasonCode::BatchInsertFailed,
        format!("batch at offset {} not stored: {}", offset, detail),
    )
}
