// Filing Consolidation Engine - Core Library
// Exposes all modules for use in the CLI and tests

pub mod error;
pub mod logging;
pub mod config;
pub mod period;
pub mod filing;
pub mod validation;     // Validation issues, audit report, tax-id checks
pub mod reader;         // Encoding-resilient record reader
pub mod archive;        // Zip payload extraction
pub mod checkpoint;     // Resumable progress state
pub mod store;          // SQLite filings + operators
pub mod loader;         // Batch loader
pub mod registry;       // Registry resolver / deduplicator
pub mod classifier;     // Claims-expense line classification
pub mod aggregation;    // Grouped sums and statistics
pub mod reconciliation; // Raw vs stored vs output totals
pub mod writer;         // Consolidation tables + archive
pub mod pipeline;       // Orchestrator

// Re-export commonly used types
pub use error::{ConsolidationError, Result};
pub use config::PipelineConfig;
pub use period::{Period, PeriodSource};
pub use filing::{FilingRecord, MISSING};
pub use validation::{AuditReport, ReasonCode, ValidationIssue, check_tax_id};
pub use reader::{DecodedTable, read_table, extract_filings};
pub use checkpoint::{CheckpointState, CheckpointStatus, CheckpointStore, RunTotals, SaveOutcome};
pub use loader::{BatchLoader, BatchReport, InsertOutcome};
pub use registry::{
    Operator, OperatorStatus, RegistryIndex, Resolution, ResolutionKind, ResolvedFiling,
    CONFLICT_SENTINEL, NOT_FOUND_SENTINEL,
};
pub use classifier::{ClaimsClassifier, ClaimsViews};
pub use aggregation::{OperatorSummary, PeriodSum, sum_by_period, summarize};
pub use reconciliation::{ReconciliationResult, ValueReconciliation};
pub use writer::{ArchiveInfo, ConsolidationOutput, ConsolidationWriter, Locale};
pub use pipeline::{LocalDirectoryClient, Pipeline, PortalClient, RegistryFeed, RunSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
