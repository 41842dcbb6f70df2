// 🗜️ Archive Extraction - period payloads arrive as zip files
//
// Entries are extracted in memory. `.csv` entries use ';', `.txt` entries
// use tab. Spreadsheet entries are reported and skipped.

use crate::error::{ConsolidationError, Result};
use crate::validation::{ReasonCode, ValidationIssue};
use std::io::{Cursor, Read};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Delimited { separator: u8 },
    Spreadsheet,
    Other,
}

/// Decide how to read an entry from its extension
pub fn entry_kind(name: &str) -> EntryKind {
    let lower = name.to_lowercase();
    if lower.ends_with(".csv") {
        EntryKind::Delimited { separator: b';' }
    } else if lower.ends_with(".txt") {
        EntryKind::Delimited { separator: b'\t' }
    } else if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
        EntryKind::Spreadsheet
    } else {
        EntryKind::Other
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFile {
    /// File name without directories
    pub name: String,
    pub separator: u8,
    pub bytes: Vec<u8>,
}

/// Extract every readable tabular entry, sorted by name
pub fn extract_zip(data: &[u8], archive_name: &str) -> Result<(Vec<ExtractedFile>, Vec<ValidationIssue>)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| ConsolidationError::Archive(format!("{}: {}", archive_name, e)))?;
    let mut files = Vec::new();
    let mut issues = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let Some(path) = entry.enclosed_name() else {
            issues.push(ValidationIssue::new(
                archive_name,
                ReasonCode::UnsupportedFormat,
                format!("entry '{}' escapes the archive root", entry.name()),
            ));
            continue;
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.name().to_string());

        match entry_kind(&name) {
            EntryKind::Delimited { separator } => {
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes)?;
                debug!(archive = archive_name, entry = %name, bytes = bytes.len(), "Extracted");
                files.push(ExtractedFile { name, separator, bytes });
            }
            EntryKind::Spreadsheet => {
                issues.push(ValidationIssue::new(
                    &name,
                    ReasonCode::UnsupportedFormat,
                    format!("spreadsheet entry in {} skipped", archive_name),
                ));
            }
            EntryKind::Other => {
                debug!(archive = archive_name, entry = %name, "Ignoring non-tabular entry");
            }
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok((files, issues))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Build an in-memory zip; shared with pipeline tests
    pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_entry_kinds() {
        assert_eq!(entry_kind("1T2025.csv"), EntryKind::Delimited { separator: b';' });
        assert_eq!(entry_kind("1T2025.TXT"), EntryKind::Delimited { separator: b'\t' });
        assert_eq!(entry_kind("1T2025.xlsx"), EntryKind::Spreadsheet);
        assert_eq!(entry_kind("leia-me.pdf"), EntryKind::Other);
    }

    #[test]
    fn test_extract_zip_sorted_and_reports_spreadsheets() {
        let data = zip_bytes(&[
            ("dir/2T2025.csv", b"A;B\n1;2\n"),
            ("1T2025.txt", b"A\tB\n1\t2\n"),
            ("3T2025.xlsx", b"PK"),
        ]);

        let (files, issues) = extract_zip(&data, "2025.zip").unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["1T2025.txt", "2T2025.csv"]);
        assert_eq!(files[0].separator, b'\t');
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].reason, ReasonCode::UnsupportedFormat);
    }

    #[test]
    fn test_garbage_is_archive_error() {
        let err = extract_zip(b"not a zip", "bad.zip").unwrap_err();
        assert!(matches!(err, ConsolidationError::Archive(_)));
    }
}
