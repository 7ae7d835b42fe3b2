//! Advisory lock serializing whole migration runs across processes.
//!
//! The lock is a single row in a dedicated table. Acquiring it is one conditional `UPDATE`
//! that only succeeds while the row is free, retried until a bounded wait runs out. The lock
//! outlives the connection that took it, so a crashed run leaves a stale lock behind that an
//! operator clears with [LockService::force_release].

use crate::error::Error;
use crate::sql::validate_table_name;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::time::{Duration, Instant};

/// Default name of the lock table.
pub const DEFAULT_LOCK_TABLE: &str = "quillbase_changelog_lock";

/// Who holds the lock, and since when.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHolder {
    pub locked_by: String,
    pub locked_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct LockService {
    table: String,
    holder: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl LockService {
    /// A lock service identified by a fresh holder id.
    pub fn new(table: impl Into<String>, timeout: Duration, poll_interval: Duration) -> Result<Self, Error> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            table,
            holder: format!("quillbase-{}", uuid::Uuid::new_v4()),
            timeout,
            poll_interval,
        })
    }

    /// Use a recognizable holder id, e.g. a host name, instead of the generated one.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Create the lock table and its single row if missing.
    pub fn ensure_table(&self, conn: &Connection) -> Result<(), Error> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY,
                locked INTEGER NOT NULL,
                locked_by TEXT,
                locked_at TEXT
            );
            INSERT OR IGNORE INTO {table} (id, locked) VALUES (1, 0);",
            table = self.table
        ))?;
        Ok(())
    }

    /// Try once to take the lock. Returns whether it was granted.
    ///
    /// A database busy with another writer counts as not granted.
    pub fn try_acquire(&self, conn: &Connection) -> Result<bool, Error> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let result = conn.execute(
            &format!(
                "UPDATE {} SET locked = 1, locked_by = ?1, locked_at = ?2 WHERE id = 1 AND locked = 0",
                self.table
            ),
            params![self.holder, now],
        );
        match result {
            Ok(updated) => Ok(updated == 1),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take the lock, polling until it is granted or the configured timeout elapses.
    pub fn acquire(&self, conn: &Connection) -> Result<(), Error> {
        self.ensure_table(conn)?;
        let started = Instant::now();
        loop {
            if self.try_acquire(conn)? {
                #[cfg(feature = "tracing")]
                tracing::debug!(holder = %self.holder, "Acquired change log lock");
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                let holder = self.status(conn)?;

                #[cfg(feature = "tracing")]
                tracing::warn!(
                    waited_ms = waited.as_millis(),
                    locked_by = ?holder.as_ref().map(|h| h.locked_by.as_str()),
                    "Timed out waiting for change log lock"
                );

                return Err(Error::LockTimeout {
                    waited,
                    locked_by: holder.as_ref().map(|h| h.locked_by.clone()),
                    locked_since: holder.and_then(|h| h.locked_since),
                });
            }
            std::thread::sleep(self.poll_interval.min(self.timeout - waited));
        }
    }

    /// Release the lock if this service holds it. Returns whether anything was released.
    pub fn release(&self, conn: &Connection) -> Result<bool, Error> {
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET locked = 0, locked_by = NULL, locked_at = NULL WHERE id = 1 AND locked = 1 AND locked_by = ?1",
                self.table
            ),
            [&self.holder],
        )?;

        #[cfg(feature = "tracing")]
        if updated == 1 {
            tracing::debug!(holder = %self.holder, "Released change log lock");
        }

        Ok(updated == 1)
    }

    /// Clear the lock whoever holds it. Returns whether it was held.
    pub fn force_release(&self, conn: &Connection) -> Result<bool, Error> {
        if !self.table_exists(conn)? {
            return Ok(false);
        }
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET locked = 0, locked_by = NULL, locked_at = NULL WHERE id = 1 AND locked = 1",
                self.table
            ),
            [],
        )?;

        #[cfg(feature = "tracing")]
        if updated == 1 {
            tracing::warn!("Forcibly released change log lock");
        }

        Ok(updated == 1)
    }

    /// The current holder, or `None` when the lock is free.
    pub fn status(&self, conn: &Connection) -> Result<Option<LockHolder>, Error> {
        if !self.table_exists(conn)? {
            return Ok(None);
        }
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                &format!(
                    "SELECT locked_by, locked_at FROM {} WHERE id = 1 AND locked = 1",
                    self.table
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(locked_by, locked_at)| LockHolder {
            locked_by: locked_by.unwrap_or_default(),
            locked_since: locked_at
                .and_then(|at| DateTime::parse_from_rfc3339(&at).ok())
                .map(|at| at.with_timezone(&Utc)),
        }))
    }

    /// Run `f` while holding the lock. The lock is released afterwards even if `f` fails.
    pub fn with_lock<T>(
        &self,
        conn: &mut Connection,
        f: impl FnOnce(&mut Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.acquire(conn)?;
        let result = f(conn);
        match self.release(conn) {
            Ok(_) => result,
            // an error from the run is more useful than the release failure
            Err(release_error) => match result {
                Ok(_) => Err(release_error),
                Err(error) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %release_error, "Failed to release change log lock");
                    Err(error)
                }
            },
        }
    }

    fn table_exists(&self, conn: &Connection) -> Result<bool, Error> {
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")?;
        Ok(stmt.exists([&self.table])?)
    }
}
