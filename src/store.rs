// 🗄️ Consolidated Store - SQLite persistence for filings and operators
//
// filings: unique on (registry_id, account_code, year, quarter). Inserts use
// INSERT OR IGNORE inside one transaction per batch, so a batch is either
// fully visible or not at all and reprocessing never duplicates a row.
//
// operators: no uniqueness on registry_id. Duplicate registrations are
// expected and handled by the registry resolver.

use crate::error::{ConsolidationError, Result};
use crate::filing::FilingRecord;
use crate::period::Period;
use crate::registry::Operator;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Open (or create) the store. Failure here is fatal for a run.
pub fn open_store(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConsolidationError::StoreUnavailable(format!("{}: {}", parent.display(), e))
            })?;
        }
    }
    let conn = Connection::open(path)
        .map_err(|e| ConsolidationError::StoreUnavailable(format!("{}: {}", path.display(), e)))?;
    setup_database(&conn)
        .map_err(|e| ConsolidationError::StoreUnavailable(format!("{}: {}", path.display(), e)))?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL keeps committed batches durable across a crash
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Filings Table
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS filings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            registry_id TEXT NOT NULL,
            account_code TEXT NOT NULL,
            year INTEGER NOT NULL,
            quarter INTEGER NOT NULL,
            description TEXT NOT NULL,
            opening_balance REAL,
            closing_balance REAL,
            filing_date TEXT,
            source_file TEXT NOT NULL,
            line_number INTEGER NOT NULL,
            extra TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (registry_id, account_code, year, quarter)
        )",
        [],
    )?;

    // ==========================================================================
    // Operators Table (duplicates allowed)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS operators (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            registry_id TEXT NOT NULL,
            tax_id TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            region TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_filings_period ON filings(year, quarter)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_operators_registry ON operators(registry_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// FILINGS
// ============================================================================

/// Insert one batch atomically. Returns the number of new rows; rows whose
/// key already exists are ignored.
pub fn insert_filings(conn: &mut Connection, records: &[FilingRecord]) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO filings (
                registry_id, account_code, year, quarter, description,
                opening_balance, closing_balance, filing_date,
                source_file, line_number, extra
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;

        for rec in records {
            let extra_json = if rec.extra.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&rec.extra)?)
            };
            inserted += stmt.execute(params![
                rec.registry_id,
                rec.account_code,
                rec.period.year,
                rec.period.quarter,
                rec.description,
                rec.opening_balance,
                rec.closing_balance,
                rec.date,
                rec.source_file,
                rec.line_number as i64,
                extra_json,
            ])?;
        }
    }
    tx.commit()?;

    debug!(
        batch = records.len(),
        inserted,
        ignored = records.len() - inserted,
        "Batch committed"
    );
    Ok(inserted)
}

/// All stored filings ordered by (period, registry id, account code)
pub fn load_filings_sorted(conn: &Connection) -> Result<Vec<FilingRecord>> {
    let mut stmt = conn.prepare(
        "SELECT registry_id, account_code, year, quarter, description,
                opening_balance, closing_balance, filing_date,
                source_file, line_number, extra
         FROM filings
         ORDER BY year, quarter, registry_id, account_code",
    )?;

    let rows = stmt
        .query_map([], |row| {
            let year: i32 = row.get(2)?;
            let quarter: u8 = row.get(3)?;
            let line_number: i64 = row.get(9)?;
            let extra_json: Option<String> = row.get(10)?;
            let extra: BTreeMap<String, String> = extra_json
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default();

            Ok(FilingRecord {
                registry_id: row.get(0)?,
                account_code: row.get(1)?,
                period: Period { year, quarter },
                description: row.get(4)?,
                opening_balance: row.get(5)?,
                closing_balance: row.get(6)?,
                date: row.get(7)?,
                source_file: row.get(8)?,
                line_number: line_number.max(0) as usize,
                extra,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn count_filings(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM filings", [], |row| row.get(0))?;
    Ok(count)
}

/// Sum of (closing - opening) over rows with both balances
pub fn stored_total(conn: &Connection) -> Result<f64> {
    let total: Option<f64> = conn.query_row(
        "SELECT SUM(closing_balance - opening_balance) FROM filings
         WHERE opening_balance IS NOT NULL AND closing_balance IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(total.unwrap_or(0.0))
}

/// Drop every stored filing ahead of a full reprocessing pass
pub fn clear_filings(conn: &Connection) -> Result<usize> {
    let removed = conn.execute("DELETE FROM filings", [])?;
    info!(removed, "Filings table cleared");
    Ok(removed)
}

// ============================================================================
// OPERATORS
// ============================================================================

/// Replace the operator table with a fresh snapshot of the registry feeds
pub fn replace_operators(conn: &mut Connection, operators: &[Operator]) -> Result<usize> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM operators", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO operators (registry_id, tax_id, name, category, region, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for op in operators {
            stmt.execute(params![
                op.registry_id,
                op.tax_id,
                op.name,
                op.category,
                op.region,
                op.status.as_str(),
            ])?;
        }
    }
    tx.commit()?;
    Ok(operators.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filing::tests::filing;
    use crate::registry::OperatorStatus;

    fn memory_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_idempotency_insert_twice() {
        let mut conn = memory_store();
        let q1 = Period::new(2025, 1).unwrap();
        let q2 = Period::new(2025, 2).unwrap();
        let records = vec![
            filing("123456", "411111111", "Despesas com Eventos / Sinistros", 0.0, 100.0, q1),
            filing("123456", "411111111", "Despesas com Eventos / Sinistros", 0.0, 150.0, q2),
            filing("654321", "411111111", "Despesas com Eventos / Sinistros", 10.0, 30.0, q1),
        ];

        let first = insert_filings(&mut conn, &records).unwrap();
        let second = insert_filings(&mut conn, &records).unwrap();

        println!("First insert: {}, second insert: {}", first, second);
        assert_eq!(first, 3);
        assert_eq!(second, 0, "Second insert should add nothing");
        assert_eq!(count_filings(&conn).unwrap(), 3);
        assert_eq!(stored_total(&conn).unwrap(), 270.0);
        println!("✅ Idempotency holds: unique key prevents duplicates");
    }

    #[test]
    fn test_load_filings_sorted_by_period_then_keys() {
        let mut conn = memory_store();
        let q1 = Period::new(2024, 4).unwrap();
        let q2 = Period::new(2025, 1).unwrap();
        let mut rec = filing("222222", "411111112", "B", 0.0, 1.0, q2);
        rec.extra.insert("UF".to_string(), "SP".to_string());
        let records = vec![
            rec,
            filing("111111", "411111111", "A", 0.0, 1.0, q2),
            filing("999999", "411111111", "C", 0.0, 1.0, q1),
        ];
        insert_filings(&mut conn, &records).unwrap();

        let loaded = load_filings_sorted(&conn).unwrap();
        let keys: Vec<&str> = loaded.iter().map(|r| r.registry_id.as_str()).collect();
        assert_eq!(keys, vec!["999999", "111111", "222222"]);
        assert_eq!(loaded[2].extra.get("UF").map(String::as_str), Some("SP"));
    }

    #[test]
    fn test_operators_allow_duplicates() {
        let mut conn = memory_store();
        let op = Operator {
            registry_id: "123456".to_string(),
            tax_id: "11222333000181".to_string(),
            name: "Saúde Exemplo".to_string(),
            category: "Cooperativa Médica".to_string(),
            region: "SP".to_string(),
            status: OperatorStatus::Active,
        };
        let mut cancelled = op.clone();
        cancelled.status = OperatorStatus::Cancelled;

        replace_operators(&mut conn, &[op.clone(), cancelled]).unwrap();
        let statuses: Vec<String> = conn
            .prepare("SELECT status FROM operators ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(statuses, vec!["ACTIVE", "CANCELLED"]);

        replace_operators(&mut conn, &[op]).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM operators", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_open_store_unavailable_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();

        let err = open_store(&blocker.join("filings.db")).unwrap_err();
        assert!(err.is_fatal());
    }
}
