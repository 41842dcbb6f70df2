// ⚙️ Pipeline Configuration
//
// Defaults, then a `.env` file (if present), then FILING_* environment
// variables. The binary applies CLI flags on top.

use crate::error::{ConsolidationError, Result};
use crate::loader::DEFAULT_BATCH_SIZE;
use crate::writer::Locale;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_ARCHIVE_NAME: &str = "consolidated_claims.zip";
pub const CHECKPOINT_FILE_NAME: &str = "progress.json";
pub const FALLBACK_CHECKPOINT_FILE_NAME: &str = "checkpoint_progress.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Holds `zips/` (period archives) and `registry/` (operator feeds)
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_fallback_path: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub batch_size: usize,
    /// Output column separator
    pub separator: u8,
    pub locale: Locale,
    pub archive_name: String,
    /// Reset the checkpoint and stored filings before the pass
    #[serde(default)]
    pub full_reprocess: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            data_dir: PathBuf::from("./data"),
            database_path: PathBuf::from("./data/filings.db"),
            checkpoint_dir: PathBuf::from("./checkpoints"),
            checkpoint_fallback_path: std::env::temp_dir().join(FALLBACK_CHECKPOINT_FILE_NAME),
            output_dir: PathBuf::from("./output"),
            log_dir: PathBuf::from("./logs"),
            batch_size: DEFAULT_BATCH_SIZE,
            separator: b';',
            locale: Locale::PtBr,
            archive_name: DEFAULT_ARCHIVE_NAME.to_string(),
            full_reprocess: false,
        }
    }
}

impl PipelineConfig {
    /// Load from `.env` and FILING_* variables
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their default
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("FILING_DATA_DIR") {
            config.database_path = PathBuf::from(&dir).join("filings.db");
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("FILING_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("FILING_CHECKPOINT_DIR") {
            config.checkpoint_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("FILING_CHECKPOINT_FALLBACK") {
            config.checkpoint_fallback_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("FILING_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FILING_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("FILING_BATCH_SIZE") {
            config.batch_size = match size.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConsolidationError::Config(format!(
                        "FILING_BATCH_SIZE must be a positive integer, got '{}'",
                        size
                    )))
                }
            };
        }
        if let Some(sep) = lookup("FILING_SEPARATOR") {
            config.separator = parse_separator(&sep)?;
        }
        if let Some(locale) = lookup("FILING_LOCALE") {
            config.locale = Locale::parse(&locale)
                .ok_or_else(|| ConsolidationError::Config(format!("unsupported locale '{}'", locale)))?;
        }
        if let Some(name) = lookup("FILING_ARCHIVE_NAME") {
            config.archive_name = name;
        }
        if let Some(flag) = lookup("FILING_FULL_REPROCESS") {
            config.full_reprocess = parse_bool(&flag)?;
        }

        Ok(config)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir.join(CHECKPOINT_FILE_NAME)
    }

    pub fn zips_dir(&self) -> PathBuf {
        self.data_dir.join("zips")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.data_dir.join("registry")
    }
}

/// A single ASCII character, or "tab" / "\t"
pub fn parse_separator(raw: &str) -> Result<u8> {
    match raw {
        "\t" | "\\t" => return Ok(b'\t'),
        s if s.eq_ignore_ascii_case("tab") => return Ok(b'\t'),
        _ => {}
    }
    match raw.trim().as_bytes() {
        [b] if b.is_ascii() => Ok(*b),
        _ => Err(ConsolidationError::Config(format!(
            "separator must be one ASCII character, got '{}'",
            raw
        ))),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConsolidationError::Config(format!("invalid boolean '{}'", other))),
    }
}
