// 📤 Consolidation Writer - locale-formatted tables packaged into one archive
//
// Tables are written as ';'-separated UTF-8 with BOM, rows in a fixed order.
// The archive is built in a temp file inside the output directory and then
// renamed over the previous one, so a half-written archive is never visible.

use crate::aggregation::{OperatorSummary, PeriodSum};
use crate::error::{ConsolidationError, Result};
use crate::registry::{ResolutionKind, ResolvedFiling};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub const WITH_DEDUCTIONS_FILE: &str = "claims_with_deductions.csv";
pub const WITHOUT_DEDUCTIONS_FILE: &str = "claims_without_deductions.csv";
pub const SUMMARY_FILE: &str = "claims_summary.csv";
pub const ALL_FILINGS_FILE: &str = "all_filings.csv";

// ============================================================================
// LOCALE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Locale {
    #[default]
    #[serde(rename = "pt-BR")]
    PtBr,
    #[serde(rename = "en-US")]
    EnUs,
}

impl Locale {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace('_', "-").as_str() {
            "pt-br" | "pt" => Some(Locale::PtBr),
            "en-us" | "en" => Some(Locale::EnUs),
            _ => None,
        }
    }

    fn separators(&self) -> (char, char) {
        match self {
            Locale::PtBr => ('.', ','),
            Locale::EnUs => (',', '.'),
        }
    }

    /// Two decimals with thousands grouping: pt-BR `1.234,56`, en-US `1,234.56`
    pub fn format_number(&self, value: f64) -> String {
        let (thousands, decimal) = self.separators();
        let fixed = format!("{:.2}", value.abs());
        let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

        let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
        for (i, c) in int_part.chars().enumerate() {
            if i > 0 && (int_part.len() - i) % 3 == 0 {
                grouped.push(thousands);
            }
            grouped.push(c);
        }

        let negative = value < 0.0 && fixed.bytes().any(|b| b.is_ascii_digit() && b != b'0');
        format!("{}{}{}{}", if negative { "-" } else { "" }, grouped, decimal, frac_part)
    }
}

// ============================================================================
// OUTPUT MODEL
// ============================================================================

/// Everything the writer needs for one run
#[derive(Debug, Clone, Default)]
pub struct ConsolidationOutput {
    pub with_deductions: Vec<ResolvedFiling>,
    pub without_deductions: Vec<PeriodSum>,
    pub summary: Vec<OperatorSummary>,
    pub all_filings: Vec<ResolvedFiling>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub sha256: String,
    pub entries: Vec<String>,
    pub bytes: u64,
}

pub fn resolution_label(kind: ResolutionKind) -> &'static str {
    match kind {
        ResolutionKind::Resolved => "RESOLVED",
        ResolutionKind::NotFound => "NOT_FOUND",
        ResolutionKind::DuplicateConflict => "DUPLICATE_CONFLICT",
    }
}

/// CSV writer that starts the file with a UTF-8 BOM
pub fn bom_csv_writer(path: &Path, separator: u8) -> Result<csv::Writer<BufWriter<File>>> {
    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(UTF8_BOM)?;
    Ok(csv::WriterBuilder::new().delimiter(separator).from_writer(file))
}

fn sort_rows(rows: &mut [ResolvedFiling]) {
    rows.sort_by(|a, b| a.record.sort_key().cmp(&b.record.sort_key()));
}

// ============================================================================
// WRITER
// ============================================================================

pub struct ConsolidationWriter {
    output_dir: PathBuf,
    separator: u8,
    locale: Locale,
    archive_name: String,
}

impl ConsolidationWriter {
    pub fn new(output_dir: impl Into<PathBuf>, separator: u8, locale: Locale, archive_name: &str) -> Self {
        ConsolidationWriter {
            output_dir: output_dir.into(),
            separator,
            locale,
            archive_name: archive_name.to_string(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn archive_path(&self) -> PathBuf {
        self.output_dir.join(&self.archive_name)
    }

    fn num(&self, value: f64) -> String {
        self.locale.format_number(value)
    }

    fn opt_num(&self, value: Option<f64>) -> String {
        value.map(|v| self.num(v)).unwrap_or_default()
    }

    /// Write the four consolidation tables; returns their paths
    pub fn write_tables(&self, output: &ConsolidationOutput) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(vec![
            self.write_with_deductions(&output.with_deductions)?,
            self.write_without_deductions(&output.without_deductions)?,
            self.write_summary(&output.summary)?,
            self.write_all_filings(&output.all_filings)?,
        ])
    }

    fn write_with_deductions(&self, rows: &[ResolvedFiling]) -> Result<PathBuf> {
        let path = self.output_dir.join(WITH_DEDUCTIONS_FILE);
        let mut rows = rows.to_vec();
        sort_rows(&mut rows);

        let mut wtr = bom_csv_writer(&path, self.separator)?;
        wtr.write_record([
            "tax_id", "name", "year", "quarter", "value", "registry_id", "account_code", "description", "resolution",
        ])?;
        for row in &rows {
            let rec = &row.record;
            wtr.write_record([
                row.tax_id.as_str(),
                row.name.as_str(),
                &*rec.period.year.to_string(),
                &*rec.period.quarter.to_string(),
                &*self.opt_num(rec.delta()),
                rec.registry_id.as_str(),
                rec.account_code.as_str(),
                rec.description.as_str(),
                resolution_label(row.resolution),
            ])?;
        }
        wtr.flush()?;
        Ok(path)
    }

    fn write_without_deductions(&self, sums: &[PeriodSum]) -> Result<PathBuf> {
        let path = self.output_dir.join(WITHOUT_DEDUCTIONS_FILE);
        let mut sums = sums.to_vec();
        sums.sort_by(|a, b| (a.period, &a.registry_id, &a.region).cmp(&(b.period, &b.registry_id, &b.region)));

        let mut wtr = bom_csv_writer(&path, self.separator)?;
        wtr.write_record(["registry_id", "tax_id", "name", "region", "year", "quarter", "value", "records"])?;
        for s in &sums {
            wtr.write_record([
                s.registry_id.as_str(),
                s.tax_id.as_str(),
                s.name.as_str(),
                s.region.as_str(),
                &*s.period.year.to_string(),
                &*s.period.quarter.to_string(),
                &*self.num(s.total),
                &*s.records.to_string(),
            ])?;
        }
        wtr.flush()?;
        Ok(path)
    }

    fn write_summary(&self, summary: &[OperatorSummary]) -> Result<PathBuf> {
        let path = self.output_dir.join(SUMMARY_FILE);
        let mut summary = summary.to_vec();
        summary.sort_by(|a, b| (&a.registry_id, &a.region).cmp(&(&b.registry_id, &b.region)));

        let mut wtr = bom_csv_writer(&path, self.separator)?;
        wtr.write_record([
            "registry_id", "tax_id", "name", "region", "total", "mean_per_period", "std_dev", "records", "periods", "years",
        ])?;
        for s in &summary {
            wtr.write_record([
                s.registry_id.as_str(),
                s.tax_id.as_str(),
                s.name.as_str(),
                s.region.as_str(),
                &*self.num(s.total),
                &*self.num(s.mean),
                &*self.num(s.std_dev),
                &*s.records.to_string(),
                &*s.periods.to_string(),
                &*s.years.to_string(),
            ])?;
        }
        wtr.flush()?;
        Ok(path)
    }

    fn write_all_filings(&self, rows: &[ResolvedFiling]) -> Result<PathBuf> {
        let path = self.output_dir.join(ALL_FILINGS_FILE);
        let mut rows = rows.to_vec();
        sort_rows(&mut rows);

        let mut wtr = bom_csv_writer(&path, self.separator)?;
        wtr.write_record([
            "year", "quarter", "registry_id", "account_code", "description", "opening_balance", "closing_balance",
            "value", "tax_id", "name", "category", "region", "resolution", "source_file", "line",
        ])?;
        for row in &rows {
            let rec = &row.record;
            wtr.write_record([
                &*rec.period.year.to_string(),
                &*rec.period.quarter.to_string(),
                rec.registry_id.as_str(),
                rec.account_code.as_str(),
                rec.description.as_str(),
                &*self.opt_num(rec.opening_balance),
                &*self.opt_num(rec.closing_balance),
                &*self.opt_num(rec.delta()),
                row.tax_id.as_str(),
                row.name.as_str(),
                row.category.as_str(),
                row.region.as_str(),
                resolution_label(row.resolution),
                rec.source_file.as_str(),
                &*rec.line_number.to_string(),
            ])?;
        }
        wtr.flush()?;
        Ok(path)
    }

    // ------------------------------------------------------------------------
    // packaging
    // ------------------------------------------------------------------------

    /// Zip `files` into the run archive and atomically replace the old one
    pub fn package(&self, files: &[PathBuf]) -> Result<ArchiveInfo> {
        std::fs::create_dir_all(&self.output_dir)?;
        let tmp = NamedTempFile::new_in(&self.output_dir)?;
        let mut zip = zip::ZipWriter::new(tmp);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut entries = Vec::new();

        for file in files {
            let Some(name) = file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let mut contents = Vec::new();
            File::open(file)?.read_to_end(&mut contents)?;
            zip.start_file(name.as_str(), options)?;
            zip.write_all(&contents)?;
            entries.push(name);
        }

        let tmp = zip.finish()?;
        tmp.as_file().sync_all()?;
        let target = self.archive_path();
        tmp.persist(&target)
            .map_err(|e| ConsolidationError::Archive(format!("{}: {}", target.display(), e.error)))?;

        let bytes = std::fs::read(&target)?;
        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        info!(archive = %target.display(), entries = entries.len(), sha256 = %sha256, "Consolidation archive written");

        Ok(ArchiveInfo {
            path: target,
            sha256,
            entries,
            bytes: bytes.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{sum_by_period, summarize};
    use crate::filing::tests::filing;
    use crate::period::Period;
    use crate::registry::Resolution;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_locale_formatting() {
        assert_eq!(Locale::PtBr.format_number(1234567.891), "1.234.567,89");
        assert_eq!(Locale::EnUs.format_number(1234567.891), "1,234,567.89");
        assert_eq!(Locale::PtBr.format_number(-250.5), "-250,50");
        assert_eq!(Locale::PtBr.format_number(999.0), "999,00");
        assert_eq!(Locale::PtBr.format_number(-0.001), "0,00");
        assert_eq!(Locale::parse("en_US"), Some(Locale::EnUs));
        assert_eq!(Locale::parse("fr"), None);
    }

    fn sample_output() -> ConsolidationOutput {
        let q1 = Period::new(2025, 1).unwrap();
        let q2 = Period::new(2025, 2).unwrap();
        let rows = vec![
            ResolvedFiling::new(
                filing("222222", "411111111", "Despesas com Eventos / Sinistros", 0.0, 1500.5, q2),
                &Resolution::NotFound,
            ),
            ResolvedFiling::new(
                filing("111111", "411111111", "Despesas com Eventos / Sinistros", 0.0, 1000.0, q1),
                &Resolution::DuplicateConflict,
            ),
        ];
        let sums = sum_by_period(&rows);
        ConsolidationOutput {
            summary: summarize(&sums),
            without_deductions: sums,
            with_deductions: rows.clone(),
            all_filings: rows,
        }
    }

    #[test]
    fn test_tables_have_bom_and_sorted_rows() {
        let dir = TempDir::new().unwrap();
        let writer = ConsolidationWriter::new(dir.path(), b';', Locale::PtBr, "out.zip");

        let paths = writer.write_tables(&sample_output()).unwrap();
        assert_eq!(paths.len(), 4);

        let bytes = std::fs::read(dir.path().join(WITH_DEDUCTIONS_FILE)).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));
        let text = String::from_utf8(bytes[3..].to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[1].starts_with("CONFLICT;CONFLICT;2025;1;1.000,00;111111"));
        assert!(lines[2].starts_with("N/A;N/A;2025;2;1.500,50;222222"));
    }

    #[test]
    fn test_package_replaces_archive_atomically() {
        let dir = TempDir::new().unwrap();
        let writer = ConsolidationWriter::new(dir.path(), b';', Locale::EnUs, "out.zip");
        let mut files = writer.write_tables(&sample_output()).unwrap();
        let log = dir.path().join("run.log");
        std::fs::write(&log, "log line\n").unwrap();
        files.push(log);

        let first = writer.package(&files).unwrap();
        let second = writer.package(&files).unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(first.sha256.len(), 64);

        let data = std::fs::read(&second.path).unwrap();
        let archive = zip::ZipArchive::new(Cursor::new(data)).unwrap();
        assert_eq!(archive.len(), 5);

        // Only the final archive remains; no stray temp files
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
