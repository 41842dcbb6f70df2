// 🚀 Pipeline Orchestrator
//
// list periods → fetch payloads → extract → read → load in batches
//   → resolve registry → classify & aggregate → write archive → finalize
//
// Fatal only when the store cannot be opened or no input file exists; both
// are checked before the checkpoint is touched. Everything else degrades:
// a missing registry feed means every filing resolves NOT_FOUND.

use crate::aggregation::{sum_by_period, summarize};
use crate::archive::{entry_kind, extract_zip, EntryKind, ExtractedFile};
use crate::checkpoint::{CheckpointStatus, CheckpointStore, RunTotals};
use crate::classifier::ClaimsClassifier;
use crate::config::PipelineConfig;
use crate::error::{ConsolidationError, Result};
use crate::filing::total_delta;
use crate::loader::{BatchLoader, InsertOutcome};
use crate::period::{select_period, Period, PeriodSource};
use crate::reader::{embedded_period, extract_filings, read_table, DESCRIPTION_COLUMNS};
use crate::reconciliation::ValueReconciliation;
use crate::registry::{annotate, parse_registry_feed, OperatorStatus, RegistryIndex};
use crate::store;
use crate::validation::{AuditReport, ReasonCode, ValidationIssue};
use crate::writer::{ArchiveInfo, ConsolidationOutput, ConsolidationWriter};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// PORTAL CLIENT (external collaborator)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFeed {
    Active,
    Cancelled,
}

impl RegistryFeed {
    pub fn file_name(&self) -> &'static str {
        match self {
            RegistryFeed::Active => "Relatorio_cadop.csv",
            RegistryFeed::Cancelled => "Relatorio_cadop_canceladas.csv",
        }
    }

    pub fn status(&self) -> OperatorStatus {
        match self {
            RegistryFeed::Active => OperatorStatus::Active,
            RegistryFeed::Cancelled => OperatorStatus::Cancelled,
        }
    }
}

/// Source of raw period files and registry feeds
pub trait PortalClient {
    fn list_available_periods(&self) -> Result<Vec<Period>>;

    /// Payload paths published for a period
    fn list_files(&self, period: Period) -> Result<Vec<String>>;

    fn fetch_file(&self, period: Period, path: &str) -> Result<Vec<u8>>;

    fn fetch_registry_feed(&self, feed: RegistryFeed) -> Result<Vec<u8>>;
}

/// Reads `<data_dir>/zips/*.zip` and `<data_dir>/registry/*.csv`
pub struct LocalDirectoryClient {
    zips_dir: PathBuf,
    registry_dir: PathBuf,
}

impl LocalDirectoryClient {
    pub fn new(zips_dir: impl Into<PathBuf>, registry_dir: impl Into<PathBuf>) -> Self {
        LocalDirectoryClient {
            zips_dir: zips_dir.into(),
            registry_dir: registry_dir.into(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.zips_dir(), config.registry_dir())
    }

    fn payloads(&self) -> Result<Vec<(Period, String)>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.zips_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match Period::from_file_name(&name) {
                Some(period) => found.push((period, name)),
                None => warn!(file = %name, "Skipping payload without a period marker"),
            }
        }
        found.sort();
        Ok(found)
    }
}

impl PortalClient for LocalDirectoryClient {
    fn list_available_periods(&self) -> Result<Vec<Period>> {
        let mut periods: Vec<Period> = self.payloads()?.into_iter().map(|(p, _)| p).collect();
        periods.dedup();
        Ok(periods)
    }

    fn list_files(&self, period: Period) -> Result<Vec<String>> {
        Ok(self
            .payloads()?
            .into_iter()
            .filter(|(p, _)| *p == period)
            .map(|(_, name)| name)
            .collect())
    }

    fn fetch_file(&self, _period: Period, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.zips_dir.join(path))?)
    }

    fn fetch_registry_feed(&self, feed: RegistryFeed) -> Result<Vec<u8>> {
        let path = self.registry_dir.join(feed.file_name());
        std::fs::read(&path).map_err(|e| ConsolidationError::Registry(format!("{}: {}", path.display(), e)))
    }
}

// ============================================================================
// RUN SUMMARY
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub periods: Vec<Period>,
    pub files_loaded: usize,
    pub files_skipped: usize,
    pub records_processed: usize,
    pub errors: usize,
    pub stored_filings: i64,
    /// All files of all periods confirmed; checkpoint marked COMPLETE
    pub complete: bool,
    pub reconciliation: ValueReconciliation,
    pub archive: ArchiveInfo,
    pub audit: AuditReport,
}

impl RunSummary {
    pub fn report(&self) -> String {
        let periods: Vec<String> = self.periods.iter().map(|p| p.marker()).collect();
        let mut out = String::new();
        out.push_str(&format!("Run {}\n", self.run_id));
        out.push_str(&format!("  Periods:          {}\n", periods.join(", ")));
        out.push_str(&format!("  Files loaded:     {}\n", self.files_loaded));
        out.push_str(&format!("  Files skipped:    {}\n", self.files_skipped));
        out.push_str(&format!("  Records processed:{:>8}\n", self.records_processed));
        out.push_str(&format!("  Errors:           {}\n", self.errors));
        out.push_str(&format!("  Stored filings:   {}\n", self.stored_filings));
        out.push_str(&format!("  Complete:         {}\n", self.complete));
        out.push_str(&format!("  Values:           {}\n", self.reconciliation.summary()));
        out.push_str(&format!("  Issues:           {}\n", self.audit.len()));
        out.push_str(&format!("  Archive:          {}\n", self.archive.path.display()));
        out.push_str(&format!("  SHA-256:          {}\n", self.archive.sha256));
        out
    }
}

/// Totals gathered while loading
#[derive(Debug, Default)]
struct LoadTally {
    files_loaded: usize,
    files_skipped: usize,
    processed: usize,
    errors: usize,
    raw_total: f64,
    /// Some file continued from a stored offset
    resumed: bool,
    all_complete: bool,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline<C: PortalClient> {
    config: PipelineConfig,
    client: C,
    classifier: ClaimsClassifier,
    run_id: String,
    log_path: Option<PathBuf>,
}

impl<C: PortalClient> Pipeline<C> {
    pub fn new(config: PipelineConfig, client: C) -> Self {
        Pipeline {
            config,
            client,
            classifier: ClaimsClassifier::new(),
            run_id: Uuid::new_v4().to_string(),
            log_path: None,
        }
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = run_id.to_string();
        self
    }

    /// Log file to package into the archive
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(self.config.checkpoint_path(), &self.config.checkpoint_fallback_path)
    }

    pub fn run(&self) -> Result<RunSummary> {
        info!(run_id = %self.run_id, "Pipeline run starting");

        // Fatal checks, before any checkpoint mutation
        let mut conn = store::open_store(&self.config.database_path)?;
        let plan = self.plan_inputs()?;

        let checkpoint = self.checkpoint_store();
        self.prepare_checkpoint(&checkpoint, &conn)?;

        let mut audit = AuditReport::new();
        let tally = self.load_periods(&plan, &checkpoint, &mut conn, &mut audit);

        let index = self.load_registry(&mut conn, &mut audit);

        // Resolve, classify, aggregate
        let stored = store::load_filings_sorted(&conn)?;
        let stored_filings = store::count_filings(&conn)?;
        let stored_total = store::stored_total(&conn)?;

        let (annotated, join_issues) = annotate(stored, &index);
        audit.extend(join_issues);

        let views = self.classifier.classify(annotated.clone());
        audit.extend(views.issues);

        let with_sums = sum_by_period(&views.with_deductions);
        let output = ConsolidationOutput {
            summary: summarize(&with_sums),
            without_deductions: sum_by_period(&views.without_deductions),
            with_deductions: views.with_deductions,
            all_filings: annotated,
        };

        let output_total: f64 = output.all_filings.iter().filter_map(|r| r.record.delta()).sum();
        let claims_total: f64 = output.with_deductions.iter().filter_map(|r| r.record.delta()).sum();
        let reconciliation = ValueReconciliation::new(
            tally.raw_total,
            stored_total,
            output_total,
            claims_total,
            tally.files_skipped > 0 || tally.resumed || !tally.all_complete,
        );
        if !reconciliation.result.is_balanced() {
            warn!(
                difference = reconciliation.result.difference(),
                "Value reconciliation: {}",
                reconciliation.summary()
            );
        }

        let archive = self.write_consolidation(&output, &audit)?;

        if tally.all_complete {
            checkpoint.mark_run_complete(RunTotals {
                processed: checkpoint.snapshot().processed,
                errors: checkpoint.snapshot().errors,
            });
        } else {
            warn!("Run finished with unconfirmed batches; next run resumes from the checkpoint");
        }

        info!(
            run_id = %self.run_id,
            processed = tally.processed,
            stored = stored_filings,
            issues = audit.len(),
            "Pipeline run finished"
        );

        Ok(RunSummary {
            run_id: self.run_id.clone(),
            periods: plan.keys().copied().collect(),
            files_loaded: tally.files_loaded,
            files_skipped: tally.files_skipped,
            records_processed: tally.processed,
            errors: tally.errors,
            stored_filings,
            complete: tally.all_complete,
            reconciliation,
            archive,
            audit,
        })
    }

    // ------------------------------------------------------------------------
    // steps
    // ------------------------------------------------------------------------

    fn plan_inputs(&self) -> Result<BTreeMap<Period, Vec<String>>> {
        let periods = self
            .client
            .list_available_periods()
            .map_err(|e| ConsolidationError::NoInputFiles(e.to_string()))?;

        let mut plan = BTreeMap::new();
        for period in periods {
            match self.client.list_files(period) {
                Ok(files) if !files.is_empty() => {
                    plan.insert(period, files);
                }
                Ok(_) => warn!(period = %period, "Period listed without files"),
                Err(e) => warn!(period = %period, "Could not list files: {}", e),
            }
        }

        if plan.is_empty() {
            error!("No input files available");
            return Err(ConsolidationError::NoInputFiles(
                "portal listed no files for any period".to_string(),
            ));
        }
        Ok(plan)
    }

    fn prepare_checkpoint(&self, checkpoint: &CheckpointStore, conn: &Connection) -> Result<()> {
        let state = match checkpoint.load() {
            Ok(state) => state,
            Err(e) => {
                warn!("{}; starting from a fresh checkpoint", e);
                checkpoint.snapshot()
            }
        };

        if self.config.full_reprocess {
            info!("Full reprocessing requested");
            checkpoint.reset();
            store::clear_filings(conn)?;
        } else if state.status == CheckpointStatus::Complete {
            info!("Previous run complete, starting a fresh pass");
            checkpoint.reset();
        } else if state.status != CheckpointStatus::NotStarted {
            info!(
                file = state.current_file.as_deref().unwrap_or("-"),
                offset = state.current_offset,
                "Resuming from checkpoint"
            );
        }
        checkpoint.set_run_id(&self.run_id);
        Ok(())
    }

    fn load_periods(
        &self,
        plan: &BTreeMap<Period, Vec<String>>,
        checkpoint: &CheckpointStore,
        conn: &mut Connection,
        audit: &mut AuditReport,
    ) -> LoadTally {
        let loader = BatchLoader::new(self.config.batch_size);
        let mut tally = LoadTally {
            all_complete: true,
            ..Default::default()
        };

        for (period, payloads) in plan {
            if checkpoint.is_period_processed(*period) {
                info!(period = %period, "Period already processed, skipping");
                tally.files_skipped += payloads.len();
                continue;
            }

            let mut period_complete = true;
            for payload in payloads {
                let files = match self.open_payload(*period, payload, audit) {
                    Some(files) => files,
                    None => {
                        period_complete = false;
                        continue;
                    }
                };

                for file in files {
                    let key = format!("{}/{}", payload, file.name);
                    if checkpoint.is_file_complete(&key) {
                        tally.files_skipped += 1;
                        continue;
                    }
                    if self.load_file(&key, &file, *period, &loader, checkpoint, conn, audit, &mut tally) {
                        checkpoint.mark_file_complete(&key);
                    } else {
                        period_complete = false;
                    }
                }
            }

            if period_complete {
                checkpoint.mark_period_processed(*period);
            } else {
                tally.all_complete = false;
            }
        }

        tally
    }

    /// Fetch a payload and expand it into tabular files
    fn open_payload(&self, period: Period, payload: &str, audit: &mut AuditReport) -> Option<Vec<ExtractedFile>> {
        let bytes = match self.client.fetch_file(period, payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(payload, "Fetch failed: {}", e);
                audit.record(ValidationIssue::new(payload, ReasonCode::FetchFailed, e.to_string()));
                return None;
            }
        };

        if payload.to_lowercase().ends_with(".zip") {
            match extract_zip(&bytes, payload) {
                Ok((files, issues)) => {
                    audit.extend(issues);
                    Some(files)
                }
                Err(e) => {
                    warn!(payload, "Archive unreadable: {}", e);
                    audit.record(ValidationIssue::new(payload, ReasonCode::FetchFailed, e.to_string()));
                    None
                }
            }
        } else {
            match entry_kind(payload) {
                EntryKind::Delimited { separator } => Some(vec![ExtractedFile {
                    name: payload.to_string(),
                    separator,
                    bytes,
                }]),
                EntryKind::Spreadsheet => {
                    audit.record(ValidationIssue::new(payload, ReasonCode::UnsupportedFormat, "spreadsheet payload skipped"));
                    Some(Vec::new())
                }
                EntryKind::Other => Some(Vec::new()),
            }
        }
    }

    /// Read and load one file. Returns true when the file needs no retry.
    #[allow(clippy::too_many_arguments)]
    fn load_file(
        &self,
        key: &str,
        file: &ExtractedFile,
        listed_period: Period,
        loader: &BatchLoader,
        checkpoint: &CheckpointStore,
        conn: &mut Connection,
        audit: &mut AuditReport,
        tally: &mut LoadTally,
    ) -> bool {
        let table = match read_table(&file.bytes, file.separator, &file.name) {
            Ok(t) => t,
            Err(e) => {
                warn!(file = %file.name, "{}", e);
                audit.record(ValidationIssue::new(&file.name, ReasonCode::DecodeFailed, e.to_string()));
                return true;
            }
        };

        let desc_col = table.column(DESCRIPTION_COLUMNS);
        let has_claims = table
            .rows
            .iter()
            .any(|row| self.classifier.matches_keywords(table.cell(row, desc_col)));
        if !has_claims {
            info!(file = %file.name, "No claims-expense lines, skipping");
            audit.record(ValidationIssue::new(&file.name, ReasonCode::NoClaimsLines, "no claims-expense description found"));
            return true;
        }

        let from_name = Period::from_file_name(&file.name);
        let Some(source) = select_period(from_name, embedded_period(&table)) else {
            audit.record(ValidationIssue::new(
                &file.name,
                ReasonCode::UnknownPeriod,
                format!("no period in file name or content (listed under {})", listed_period),
            ));
            return true;
        };
        if let PeriodSource::Conflict { file_name, embedded } = source {
            warn!(file = %file.name, %file_name, %embedded, "Period mismatch, using embedded date");
            audit.record(ValidationIssue::new(
                &file.name,
                ReasonCode::PeriodMismatch,
                format!("file name says {}, embedded date says {}", file_name, embedded),
            ));
        }
        let period = source.period();

        let (records, issues) = extract_filings(&table, &file.name, period);
        audit.extend(issues);

        let offset = checkpoint.resume_offset(key);
        tally.resumed |= offset > 0;
        tally.raw_total += total_delta(records.get(offset..).unwrap_or(&[]));

        let report = loader.load(key, records, offset, checkpoint, |batch| {
            store::insert_filings(conn, batch).map(|n| InsertOutcome::Inserted(Some(n)))
        });

        tally.processed += report.processed;
        tally.errors += report.errors;
        let completed = report.completed();
        audit.extend(report.issues);
        if completed {
            tally.files_loaded += 1;
        }
        completed
    }

    fn load_registry(&self, conn: &mut Connection, audit: &mut AuditReport) -> RegistryIndex {
        let mut operators = Vec::new();
        let mut loaded_any = false;

        for feed in [RegistryFeed::Active, RegistryFeed::Cancelled] {
            let parsed = self
                .client
                .fetch_registry_feed(feed)
                .and_then(|bytes| read_table(&bytes, b';', feed.file_name()));
            match parsed {
                Ok(table) => {
                    let (ops, issues) = parse_registry_feed(&table, feed.status(), feed.file_name());
                    operators.extend(ops);
                    audit.extend(issues);
                    loaded_any = true;
                }
                Err(e) => {
                    warn!(feed = feed.file_name(), "Registry feed unavailable: {}", e);
                    audit.record(ValidationIssue::new(feed.file_name(), ReasonCode::RegistryUnavailable, e.to_string()));
                }
            }
        }

        if !loaded_any {
            warn!("No registry feed available, every filing resolves NOT_FOUND");
            return RegistryIndex::empty();
        }

        if let Err(e) = store::replace_operators(conn, &operators) {
            warn!("Could not store operators: {}", e);
        }
        let index = RegistryIndex::build(operators);
        let conflicting = index.conflicting_ids();
        if !conflicting.is_empty() {
            warn!(count = conflicting.len(), ids = %conflicting.join(","), "Registry ids without a unique active entry");
        }
        index
    }

    fn write_consolidation(&self, output: &ConsolidationOutput, audit: &AuditReport) -> Result<ArchiveInfo> {
        let writer = ConsolidationWriter::new(
            &self.config.output_dir,
            self.config.separator,
            self.config.locale,
            &self.config.archive_name,
        );
        let mut files = writer.write_tables(output)?;
        files.extend(audit.write_to_dir(writer.output_dir())?);
        if let Some(log) = self.log_path.as_deref().filter(|p| p.exists()) {
            files.push(log.to_path_buf());
        }
        writer.package(&files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::zip_bytes;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> PipelineConfig {
        PipelineConfig {
            data_dir: dir.path().join("data"),
            database_path: dir.path().join("data").join("filings.db"),
            checkpoint_dir: dir.path().join("checkpoints"),
            checkpoint_fallback_path: dir.path().join("fallback.json"),
            output_dir: dir.path().join("output"),
            log_dir: dir.path().join("logs"),
            ..PipelineConfig::default()
        }
    }

    fn write_inputs(config: &PipelineConfig) {
        std::fs::create_dir_all(config.zips_dir()).unwrap();
        std::fs::create_dir_all(config.registry_dir()).unwrap();
        let csv = "DATA;REG_ANS;CD_CONTA_CONTABIL;DESCRICAO;VL_SALDO_INICIAL;VL_SALDO_FINAL\n\
                   2025-01-01;111111;411111111;Despesas com Eventos / Sinistros;0;100,00\n";
        std::fs::write(
            config.zips_dir().join("1T2025.zip"),
            zip_bytes(&[("1T2025.csv", csv.as_bytes())]),
        )
        .unwrap();
        std::fs::write(
            config.registry_dir().join(RegistryFeed::Active.file_name()),
            "REGISTRO_OPERADORA;CNPJ;RAZAO_SOCIAL;MODALIDADE;UF\n111111;11222333000181;Operadora A;Medicina de Grupo;SP\n",
        )
        .unwrap();
    }

    #[test]
    fn test_local_client_lists_periods_from_file_names() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_inputs(&config);
        std::fs::write(config.zips_dir().join("readme.zip"), b"x").unwrap();

        let client = LocalDirectoryClient::from_config(&config);
        assert_eq!(client.list_available_periods().unwrap(), vec![Period::new(2025, 1).unwrap()]);
        assert_eq!(client.list_files(Period::new(2025, 1).unwrap()).unwrap(), vec!["1T2025.zip"]);
        assert!(client.fetch_registry_feed(RegistryFeed::Cancelled).is_err());
    }

    #[test]
    fn test_no_input_files_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        std::fs::create_dir_all(config.zips_dir()).unwrap();

        let pipeline = Pipeline::new(config.clone(), LocalDirectoryClient::from_config(&config));
        let err = pipeline.run().unwrap_err();
        assert!(matches!(err, ConsolidationError::NoInputFiles(_)));
        assert!(!config.checkpoint_path().exists(), "checkpoint untouched");
    }

    #[test]
    fn test_single_period_run_with_one_missing_feed() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_inputs(&config);

        let pipeline = Pipeline::new(config.clone(), LocalDirectoryClient::from_config(&config));
        let summary = pipeline.run().unwrap();

        assert!(summary.complete);
        assert_eq!(summary.files_loaded, 1);
        assert_eq!(summary.stored_filings, 1);
        assert!(summary.reconciliation.result.is_balanced());
        assert_eq!(summary.audit.count(ReasonCode::RegistryUnavailable), 1);
        assert!(summary.archive.path.exists());
        assert_eq!(
            pipeline.checkpoint_store().load().unwrap().status,
            CheckpointStatus::Complete
        );
    }

    #[test]
    fn test_period_and_content_skips_are_reported() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_inputs(&config);

        let header = "DATA;REG_ANS;CD_CONTA_CONTABIL;DESCRICAO;VL_SALDO_INICIAL;VL_SALDO_FINAL\n";
        // Name says Q1, content says Q2
        let mismatched = format!("{}2025-04-01;111111;411111111;Despesas com Eventos / Sinistros;0;40,00\n", header);
        // No marker in the name, no date column
        let undated = "REG_ANS;CD_CONTA_CONTABIL;DESCRICAO;VL_SALDO_INICIAL;VL_SALDO_FINAL\n\
                       111111;411111111;Despesas com Eventos / Sinistros;0;5,00\n";
        // Dated, but no claims-expense line
        let no_claims = format!("{}2025-07-01;111111;311111111;Receitas;0;9,00\n", header);

        std::fs::write(
            config.zips_dir().join("3T2025.zip"),
            zip_bytes(&[
                ("1T2025_extra.csv", mismatched.as_bytes()),
                ("dados.csv", undated.as_bytes()),
                ("3T2025.csv", no_claims.as_bytes()),
            ]),
        )
        .unwrap();

        let pipeline = Pipeline::new(config.clone(), LocalDirectoryClient::from_config(&config));
        let summary = pipeline.run().unwrap();

        assert!(summary.complete, "deterministic skips still complete the run");
        assert_eq!(summary.audit.count(ReasonCode::PeriodMismatch), 1);
        assert_eq!(summary.audit.count(ReasonCode::UnknownPeriod), 1);
        assert_eq!(summary.audit.count(ReasonCode::NoClaimsLines), 1);

        // The mismatched row is stored under the embedded quarter
        let conn = store::open_store(&config.database_path).unwrap();
        let stored = store::load_filings_sorted(&conn).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().any(|r| r.period == Period::new(2025, 2).unwrap()));
        assert!(stored.iter().all(|r| r.source_file != "dados.csv"));

        let checkpoint = pipeline.checkpoint_store().load().unwrap();
        assert!(checkpoint.completed_files.contains("3T2025.zip/dados.csv"));
    }
}
