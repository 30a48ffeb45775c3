//! Relational persistence for scraped figures, ASP metadata, credentials
//! and execution logs.

use std::path::Path;
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::error::EngineError;
use crate::types::{AspRow, Credential, ExecutionType, RunStatus, TargetTable};

/// Narrow repository surface the engine writes through.
///
/// Scraped figures are superseded wholesale: callers delete the covered
/// `(asp, media, date-range)` window, then upsert the fresh batch, so a
/// re-scrape leaves exactly one row per `(date, media, account item, asp)`.
pub trait RecordStore: Send + Sync {
    fn get_asp(&self, name: &str) -> Result<Option<AspRow>, EngineError>;

    /// Names of ASPs that carry a stored scenario.
    fn list_scenario_asps(&self) -> Result<Vec<String>, EngineError>;

    fn upsert_daily(
        &self,
        date: NaiveDate,
        amount: i64,
        media_id: &str,
        account_item_id: &str,
        asp_id: &str,
    ) -> Result<(), EngineError>;

    /// `period_end` is the last calendar day of the reported month.
    fn upsert_monthly(
        &self,
        period_end: NaiveDate,
        amount: i64,
        media_id: &str,
        account_item_id: &str,
        asp_id: &str,
    ) -> Result<(), EngineError>;

    fn delete_range(
        &self,
        asp_id: &str,
        media_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        table: TargetTable,
    ) -> Result<(), EngineError>;

    fn create_execution_log(
        &self,
        asp_id: Option<&str>,
        execution_type: ExecutionType,
        metadata: &serde_json::Value,
    ) -> Result<i64, EngineError>;

    fn finalize_execution_log(
        &self,
        log_id: i64,
        status: RunStatus,
        records_saved: u32,
        error_message: Option<&str>,
    ) -> Result<(), EngineError>;

    fn get_credential(
        &self,
        asp_id: &str,
        media_id: &str,
    ) -> Result<Option<Credential>, EngineError>;

    /// Best-effort status stamp on the ASP row after a run.
    fn stamp_asp_status(
        &self,
        asp_id: &str,
        status: &str,
        note: Option<&str>,
    ) -> Result<(), EngineError>;

    /// Store a rendered scenario on the ASP row. Returns false when no such
    /// ASP exists.
    fn set_asp_prompt(&self, name: &str, prompt: &str) -> Result<bool, EngineError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS asps (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    login_url TEXT,
    prompt TEXT,
    media_id TEXT,
    account_item_id TEXT,
    last_run_at TEXT,
    last_run_status TEXT,
    last_run_note TEXT
);

CREATE TABLE IF NOT EXISTS asp_credentials (
    asp_id TEXT NOT NULL,
    media_id TEXT NOT NULL,
    username_key TEXT NOT NULL,
    password_key TEXT NOT NULL,
    PRIMARY KEY (asp_id, media_id)
);

CREATE TABLE IF NOT EXISTS daily_actuals (
    date TEXT NOT NULL,
    amount INTEGER NOT NULL,
    media_id TEXT NOT NULL,
    account_item_id TEXT NOT NULL,
    asp_id TEXT NOT NULL,
    UNIQUE (date, media_id, account_item_id, asp_id)
);

CREATE TABLE IF NOT EXISTS actuals (
    date TEXT NOT NULL,
    amount INTEGER NOT NULL,
    media_id TEXT NOT NULL,
    account_item_id TEXT NOT NULL,
    asp_id TEXT NOT NULL,
    UNIQUE (date, media_id, account_item_id, asp_id)
);

CREATE TABLE IF NOT EXISTS execution_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asp_id TEXT,
    execution_type TEXT NOT NULL,
    status TEXT NOT NULL,
    records_saved INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    metadata TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_daily_actuals_range ON daily_actuals (asp_id, media_id, date);
CREATE INDEX IF NOT EXISTS idx_actuals_range ON actuals (asp_id, media_id, date);
"#;

/// SQLite-backed store. The connection is shared across sequential runs.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "record store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another run already panicked mid-write;
        // there is no meaningful recovery beyond using the connection.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn()
    }

    fn upsert(
        &self,
        table: TargetTable,
        date: NaiveDate,
        amount: i64,
        media_id: &str,
        account_item_id: &str,
        asp_id: &str,
    ) -> Result<(), EngineError> {
        let sql = format!(
            "INSERT INTO {} (date, amount, media_id, account_item_id, asp_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (date, media_id, account_item_id, asp_id)
             DO UPDATE SET amount = excluded.amount",
            table_name(table)
        );
        self.conn().execute(
            &sql,
            params![date.to_string(), amount, media_id, account_item_id, asp_id],
        )?;
        Ok(())
    }
}

fn table_name(table: TargetTable) -> &'static str {
    match table {
        TargetTable::Daily => "daily_actuals",
        TargetTable::Monthly => "actuals",
    }
}

impl RecordStore for SqliteStore {
    fn get_asp(&self, name: &str) -> Result<Option<AspRow>, EngineError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, name, login_url, prompt, media_id, account_item_id
                 FROM asps WHERE name = ?1",
                [name],
                |row| {
                    Ok(AspRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        login_url: row.get(2)?,
                        prompt: row.get(3)?,
                        media_id: row.get(4)?,
                        account_item_id: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn list_scenario_asps(&self) -> Result<Vec<String>, EngineError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name FROM asps WHERE prompt IS NOT NULL ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn upsert_daily(
        &self,
        date: NaiveDate,
        amount: i64,
        media_id: &str,
        account_item_id: &str,
        asp_id: &str,
    ) -> Result<(), EngineError> {
        self.upsert(TargetTable::Daily, date, amount, media_id, account_item_id, asp_id)
    }

    fn upsert_monthly(
        &self,
        period_end: NaiveDate,
        amount: i64,
        media_id: &str,
        account_item_id: &str,
        asp_id: &str,
    ) -> Result<(), EngineError> {
        self.upsert(
            TargetTable::Monthly,
            period_end,
            amount,
            media_id,
            account_item_id,
            asp_id,
        )
    }

    fn delete_range(
        &self,
        asp_id: &str,
        media_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        table: TargetTable,
    ) -> Result<(), EngineError> {
        let sql = format!(
            "DELETE FROM {} WHERE asp_id = ?1 AND media_id = ?2 AND date >= ?3 AND date <= ?4",
            table_name(table)
        );
        self.conn()
            .execute(&sql, params![asp_id, media_id, start.to_string(), end.to_string()])?;
        Ok(())
    }

    fn create_execution_log(
        &self,
        asp_id: Option<&str>,
        execution_type: ExecutionType,
        metadata: &serde_json::Value,
    ) -> Result<i64, EngineError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO execution_logs (asp_id, execution_type, status, metadata, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                asp_id,
                execution_type.as_str(),
                RunStatus::Running.as_str(),
                metadata.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn finalize_execution_log(
        &self,
        log_id: i64,
        status: RunStatus,
        records_saved: u32,
        error_message: Option<&str>,
    ) -> Result<(), EngineError> {
        self.conn().execute(
            "UPDATE execution_logs
             SET status = ?2, records_saved = ?3, error_message = ?4, completed_at = ?5
             WHERE id = ?1",
            params![
                log_id,
                status.as_str(),
                records_saved,
                error_message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_credential(
        &self,
        asp_id: &str,
        media_id: &str,
    ) -> Result<Option<Credential>, EngineError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT username_key, password_key FROM asp_credentials
                 WHERE asp_id = ?1 AND media_id = ?2",
                [asp_id, media_id],
                |row| {
                    Ok(Credential {
                        username_key: row.get(0)?,
                        password_key: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn stamp_asp_status(
        &self,
        asp_id: &str,
        status: &str,
        note: Option<&str>,
    ) -> Result<(), EngineError> {
        let note = note.map(|n| n.chars().take(500).collect::<String>());
        self.conn().execute(
            "UPDATE asps SET last_run_at = ?2, last_run_status = ?3, last_run_note = ?4
             WHERE id = ?1",
            params![asp_id, Utc::now().to_rfc3339(), status, note],
        )?;
        Ok(())
    }

    fn set_asp_prompt(&self, name: &str, prompt: &str) -> Result<bool, EngineError> {
        let changed = self.conn().execute(
            "UPDATE asps SET prompt = ?2 WHERE name = ?1",
            params![name, prompt],
        )?;
        Ok(changed > 0)
    }
}
