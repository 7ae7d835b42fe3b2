//! The tracking table: an append-only log of change-set executions stored in the target database.
//!
//! Every execution, failure, skip and rollback appends a row; nothing is updated or deleted.
//! The *effective* state of a change set is its latest row, and it counts as applied when
//! that row is `EXECUTED`, `MARK_RAN` or `RERAN`.

use crate::changelog::{ChangeSet, ChangeSetKey};
use crate::error::Error;
use crate::sql::validate_table_name;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Default name of the tracking table.
pub const DEFAULT_CHANGELOG_TABLE: &str = "quillbase_changelog";

/// How a change set was handled by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecType {
    Executed,
    Failed,
    /// Recorded as ran without executing, by a precondition or `changelog_sync`.
    MarkRan,
    /// Executed again because a `runOnChange` change set changed.
    Reran,
    /// Reversal marker appended by a rollback.
    RolledBack,
}

impl ExecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
            Self::MarkRan => "MARK_RAN",
            Self::Reran => "RERAN",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    /// Whether a change set whose latest record has this type counts as applied.
    pub fn is_effective(&self) -> bool {
        matches!(self, Self::Executed | Self::MarkRan | Self::Reran)
    }
}

impl fmt::Display for ExecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ExecType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXECUTED" => Ok(Self::Executed),
            "FAILED" => Ok(Self::Failed),
            "MARK_RAN" => Ok(Self::MarkRan),
            "RERAN" => Ok(Self::Reran),
            "ROLLED_BACK" => Ok(Self::RolledBack),
            other => Err(format!("unknown execution type '{}'", other)),
        }
    }
}

/// One row of the tracking table.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub key: ChangeSetKey,
    /// Checksum of the change set when this row was written.
    pub checksum: String,
    pub executed_at: DateTime<Utc>,
    pub exec_type: ExecType,
    pub tag: Option<String>,
    pub description: Option<String>,
    /// Shared by every row written in the same run.
    pub deployment_id: Option<String>,
    /// Insertion order within the tracking table.
    pub sequence: i64,
}

/// A row about to be written.
#[derive(Debug, Clone)]
pub struct NewExecution<'a> {
    pub key: &'a ChangeSetKey,
    pub checksum: &'a str,
    pub exec_type: ExecType,
    pub tag: Option<&'a str>,
    pub description: Option<&'a str>,
    pub deployment_id: Option<&'a str>,
}

impl<'a> NewExecution<'a> {
    pub fn for_change_set(change_set: &'a ChangeSet, exec_type: ExecType) -> Self {
        Self {
            key: &change_set.key,
            checksum: &change_set.checksum,
            exec_type,
            tag: change_set.tag.as_deref(),
            description: None,
            deployment_id: None,
        }
    }

    pub fn description(mut self, description: &'a str) -> Self {
        self.description = Some(description);
        self
    }

    pub fn deployment_id(mut self, deployment_id: &'a str) -> Self {
        self.deployment_id = Some(deployment_id);
        self
    }
}

/// Reads and appends rows of the tracking table.
///
/// All methods take a [Connection]; pass a [rusqlite::Transaction] (which derefs to one) to
/// make the write part of a larger unit of work.
#[derive(Debug, Clone)]
pub struct ExecutionTracker {
    table: String,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self {
            table: DEFAULT_CHANGELOG_TABLE.to_string(),
        }
    }
}

impl ExecutionTracker {
    pub fn new(table: impl Into<String>) -> Result<Self, Error> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { table })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn table_exists(&self, conn: &Connection) -> Result<bool, Error> {
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")?;
        Ok(stmt.exists([&self.table])?)
    }

    /// Create the tracking table if it is missing. Returns whether it was created.
    pub fn ensure_table(&self, conn: &Connection) -> Result<bool, Error> {
        if self.table_exists(conn)? {
            return Ok(false);
        }
        // IF NOT EXISTS covers a concurrent creation between the check and here
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                author TEXT NOT NULL,
                change_log TEXT NOT NULL,
                checksum TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                exec_type TEXT NOT NULL,
                tag TEXT,
                description TEXT,
                deployment_id TEXT
            );
            CREATE INDEX IF NOT EXISTS {table}_key ON {table} (change_log, id, author);",
            table = self.table
        ))?;

        #[cfg(feature = "tracing")]
        tracing::info!(table = %self.table, "Created tracking table");

        Ok(true)
    }

    /// Append a row. The table must exist.
    pub fn record_execution(
        &self,
        conn: &Connection,
        entry: &NewExecution<'_>,
    ) -> rusqlite::Result<ExecutionRecord> {
        // stored with microsecond precision, truncate so the returned record matches a re-read
        let executed_at = Utc::now().trunc_subsecs(6);
        conn.execute(
            &format!(
                "INSERT INTO {} (id, author, change_log, checksum, executed_at, exec_type, tag, description, deployment_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                self.table
            ),
            params![
                entry.key.id,
                entry.key.author,
                entry.key.change_log,
                entry.checksum,
                format_timestamp(&executed_at),
                entry.exec_type.as_str(),
                entry.tag,
                entry.description,
                entry.deployment_id,
            ],
        )?;

        Ok(ExecutionRecord {
            key: entry.key.clone(),
            checksum: entry.checksum.to_string(),
            executed_at,
            exec_type: entry.exec_type,
            tag: entry.tag.map(str::to_string),
            description: entry.description.map(str::to_string),
            deployment_id: entry.deployment_id.map(str::to_string),
            sequence: conn.last_insert_rowid(),
        })
    }

    /// Append a `ROLLED_BACK` marker for a previously effective record.
    pub fn append_reversal(
        &self,
        conn: &Connection,
        record: &ExecutionRecord,
        deployment_id: Option<&str>,
    ) -> rusqlite::Result<ExecutionRecord> {
        self.record_execution(
            conn,
            &NewExecution {
                key: &record.key,
                checksum: &record.checksum,
                exec_type: ExecType::RolledBack,
                tag: None,
                description: Some("rollback"),
                deployment_id,
            },
        )
    }

    /// Every row, in insertion order. Empty when the table does not exist.
    pub fn history(&self, conn: &Connection) -> Result<Vec<ExecutionRecord>, Error> {
        if !self.table_exists(conn)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT id, author, change_log, checksum, executed_at, exec_type, tag, description, deployment_id, sequence
             FROM {} ORDER BY sequence",
            self.table
        ))?;
        let records = stmt
            .query_map([], read_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Effective records, ordered by execution time ascending.
    pub fn list_executed(&self, conn: &Connection) -> Result<Vec<ExecutionRecord>, Error> {
        Ok(TrackerState::from_history(self.history(conn)?).executed)
    }

    /// Append reversal markers for the latest `n` effective records, newest first,
    /// without running any rollback changes. Returns the markers.
    pub fn remove_latest(&self, conn: &Connection, n: usize) -> Result<Vec<ExecutionRecord>, Error> {
        let executed = self.list_executed(conn)?;
        executed
            .iter()
            .rev()
            .take(n)
            .map(|record| self.append_reversal(conn, record, None).map_err(Error::from))
            .collect()
    }
}

/// The tracker's contents as seen by the planner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerState {
    /// Latest row per change set, whatever its type.
    pub latest: HashMap<ChangeSetKey, ExecutionRecord>,
    /// Effective records ordered by `executed_at`, ties broken by sequence.
    pub executed: Vec<ExecutionRecord>,
}

impl TrackerState {
    pub fn load(tracker: &ExecutionTracker, conn: &Connection) -> Result<Self, Error> {
        Ok(Self::from_history(tracker.history(conn)?))
    }

    pub fn from_history(history: Vec<ExecutionRecord>) -> Self {
        let mut latest: HashMap<ChangeSetKey, ExecutionRecord> = HashMap::new();
        for record in history {
            match latest.get(&record.key) {
                Some(existing) if existing.sequence > record.sequence => {}
                _ => {
                    latest.insert(record.key.clone(), record);
                }
            }
        }
        let mut executed: Vec<ExecutionRecord> = latest
            .values()
            .filter(|r| r.exec_type.is_effective())
            .cloned()
            .collect();
        executed.sort_by(|a, b| {
            a.executed_at
                .cmp(&b.executed_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Self { latest, executed }
    }

    pub fn is_applied(&self, key: &ChangeSetKey) -> bool {
        self.latest
            .get(key)
            .is_some_and(|r| r.exec_type.is_effective())
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let executed_at: String = row.get(4)?;
    let executed_at = DateTime::parse_from_rfc3339(&executed_at)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);
    let exec_type: String = row.get(5)?;
    let exec_type = exec_type.parse::<ExecType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(ExecutionRecord {
        key: ChangeSetKey {
            id: row.get(0)?,
            author: row.get(1)?,
            change_log: row.get(2)?,
        },
        checksum: row.get(3)?,
        executed_at,
        exec_type,
        tag: row.get(6)?,
        description: row.get(7)?,
        deployment_id: row.get(8)?,
        sequence: row.get(9)?,
    })
}
