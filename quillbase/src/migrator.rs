//! The [Migrator]: the entry point owning a parsed change log and running it against a database.
//!
//! # Example
//!
//! ```
//! use quillbase::{Migrator, DocumentFormat};
//! use rusqlite::Connection;
//!
//! # fn main() -> Result<(), quillbase::Error> {
//! let migrator = Migrator::from_source(
//!     r#"
//! databaseChangeLog:
//!   - changeSet:
//!       id: create-users
//!       author: alice
//!       changes:
//!         - createTable:
//!             tableName: users
//!             columns:
//!               - { name: id, type: INTEGER, primaryKey: true }
//! "#,
//!     DocumentFormat::Yaml,
//! )?;
//!
//! let mut conn = Connection::open_in_memory()?;
//! let report = migrator.update(&mut conn)?;
//! assert_eq!(report.executed.len(), 1);
//! assert!(migrator.status(&conn)?.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! Every mutating operation sets the configured busy timeout and then holds the change log
//! lock for the whole plan-and-apply run, so concurrent runs against the same database are
//! serialized. Change sets are applied one at a time, each in its own transaction.

use crate::change::ChangeRegistry;
use crate::changelog::{ChangeLog, ChangeSetKey};
use crate::config::MigratorConfig;
use crate::diff::{compare, DiffResult};
use crate::error::{Error, PartialApplyWarning};
use crate::executor::{without_foreign_keys, Executor, Outcome};
use crate::lock::LockService;
use crate::parser::{ChangeLogParser, DocumentFormat};
use crate::planner::{MigrationPlanner, PlannedChangeSet, PlannedRollback};
use crate::projection::{project, ChangeSetRow};
use crate::snapshot::SchemaSnapshot;
use crate::sql::{quote_ident, validate_table_name};
use crate::tracker::{ExecType, ExecutionRecord, ExecutionTracker, NewExecution, TrackerState};
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stops a run before its next change set. A change set already in progress always finishes.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A change set that failed during a run.
#[derive(Debug)]
pub struct ChangeSetFailure {
    pub key: ChangeSetKey,
    pub error: Error,
}

/// A report of actions performed by [Migrator::update].
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub tracking_table_existed: bool,
    pub tracking_table_created: bool,
    /// Executed or re-run change sets, in order.
    pub executed: Vec<ChangeSetKey>,
    /// Recorded as ran without executing, because a precondition said so.
    pub marked_ran: Vec<ChangeSetKey>,
    /// Skipped for this run by a `CONTINUE` precondition.
    pub skipped: Vec<ChangeSetKey>,
    /// `failOnError: false` change sets that failed and were recorded as `FAILED`.
    pub failed: Vec<ChangeSetFailure>,
    pub warnings: Vec<PartialApplyWarning>,
    /// The change set that stopped the run.
    pub failing_change_set: Option<ChangeSetFailure>,
    pub cancelled: bool,
}

impl UpdateReport {
    /// Whether every planned change set was handled: no stop, no cancellation, no warning.
    pub fn is_complete(&self) -> bool {
        self.failing_change_set.is_none() && !self.cancelled && self.warnings.is_empty()
    }
}

/// A report of actions performed by [Migrator::rollback] and [Migrator::rollback_to_tag].
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Reversed change sets, newest first.
    pub rolled_back: Vec<ChangeSetKey>,
    pub warnings: Vec<PartialApplyWarning>,
    pub failing_change_set: Option<ChangeSetFailure>,
    pub cancelled: bool,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.failing_change_set.is_none() && !self.cancelled && self.warnings.is_empty()
    }
}

/// The entrypoint for running a change log against SQLite databases.
pub struct Migrator {
    change_log: ChangeLog,
    registry: ChangeRegistry,
    config: MigratorConfig,
    cancellation: CancellationToken,
    on_change_set_start: Option<Box<dyn Fn(&ChangeSetKey) + Send + Sync>>,
    on_change_set_complete: Option<Box<dyn Fn(&ChangeSetKey, Duration) + Send + Sync>>,
    on_change_set_skipped: Option<Box<dyn Fn(&ChangeSetKey, &str) + Send + Sync>>,
    on_change_set_error: Option<Box<dyn Fn(&ChangeSetKey, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("change_log", &self.change_log.root())
            .field("change_sets", &self.change_log.len())
            .field("config", &self.config)
            .field("on_change_set_start", &self.on_change_set_start.is_some())
            .field("on_change_set_complete", &self.on_change_set_complete.is_some())
            .field("on_change_set_skipped", &self.on_change_set_skipped.is_some())
            .field("on_change_set_error", &self.on_change_set_error.is_some())
            .finish()
    }
}

impl Migrator {
    /// A migrator for an already parsed change log. `registry` must be the one it was parsed with.
    pub fn new(change_log: ChangeLog, registry: ChangeRegistry) -> Self {
        Self {
            change_log,
            registry,
            config: MigratorConfig::default(),
            cancellation: CancellationToken::default(),
            on_change_set_start: None,
            on_change_set_complete: None,
            on_change_set_skipped: None,
            on_change_set_error: None,
        }
    }

    /// Parse a change-log file with the built-in change types.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_file_with_registry(path, ChangeRegistry::builtin())
    }

    pub fn from_file_with_registry(path: impl AsRef<Path>, registry: ChangeRegistry) -> Result<Self, Error> {
        let change_log = ChangeLogParser::new(&registry).parse_file(path)?;
        Ok(Self::new(change_log, registry))
    }

    /// Parse an in-memory change log with the built-in change types. Includes resolve against
    /// the working directory and change sets are keyed under `changelog`.
    pub fn from_source(source: &str, format: DocumentFormat) -> Result<Self, Error> {
        let registry = ChangeRegistry::builtin();
        let change_log = ChangeLogParser::new(&registry).parse_str(source, format, ".", "changelog")?;
        Ok(Self::new(change_log, registry))
    }

    pub fn with_config(mut self, config: MigratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set a custom name for the tracking table (default `quillbase_changelog`).
    pub fn with_changelog_table(mut self, name: impl Into<String>) -> Self {
        self.config.changelog_table = name.into();
        self
    }

    /// Set a custom name for the lock table (default `quillbase_changelog_lock`).
    pub fn with_lock_table(mut self, name: impl Into<String>) -> Self {
        self.config.lock_table = name.into();
        self
    }

    /// How long to wait for another run to release the lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Set the SQLite busy timeout used for concurrent access. Default is 30 seconds.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.config.busy_timeout = timeout;
        self
    }

    pub fn with_transactional_ddl(mut self, transactional_ddl: bool) -> Self {
        self.config.transactional_ddl = transactional_ddl;
        self
    }

    /// Accept checksum mismatches of applied change sets instead of failing.
    pub fn with_accept_drift(mut self, accept: bool) -> Self {
        self.config.accept_drift = accept;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Called before each change set is applied or reversed.
    pub fn on_change_set_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeSetKey) + Send + Sync + 'static,
    {
        self.on_change_set_start = Some(Box::new(callback));
        self
    }

    /// Called after each change set is applied or reversed, with how long it took.
    pub fn on_change_set_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeSetKey, Duration) + Send + Sync + 'static,
    {
        self.on_change_set_complete = Some(Box::new(callback));
        self
    }

    /// Called when a precondition marks a change set as ran or skips it, with the reason.
    pub fn on_change_set_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeSetKey, &str) + Send + Sync + 'static,
    {
        self.on_change_set_skipped = Some(Box::new(callback));
        self
    }

    pub fn on_change_set_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeSetKey, &Error) + Send + Sync + 'static,
    {
        self.on_change_set_error = Some(Box::new(callback));
        self
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    pub fn registry(&self) -> &ChangeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Change sets an update would apply, in order.
    pub fn status(&self, conn: &Connection) -> Result<Vec<PlannedChangeSet<'_>>, Error> {
        let state = TrackerState::load(&self.tracker()?, conn)?;
        Ok(self.planner().plan_update(&state, None))
    }

    /// What `rollback(count)` would reverse, without running anything.
    pub fn preview_rollback(&self, conn: &Connection, count: usize) -> Result<Vec<PlannedRollback<'_>>, Error> {
        let state = TrackerState::load(&self.tracker()?, conn)?;
        self.planner().plan_rollback(&state, count)
    }

    /// Check recorded checksums against the change log.
    pub fn validate(&self, conn: &Connection) -> Result<(), Error> {
        let state = TrackerState::load(&self.tracker()?, conn)?;
        self.planner().validate(&state)
    }

    /// Apply every pending change set.
    pub fn update(&self, conn: &mut Connection) -> Result<UpdateReport, Error> {
        self.run_update(conn, None)
    }

    /// Apply at most `count` pending change sets.
    pub fn update_count(&self, conn: &mut Connection, count: usize) -> Result<UpdateReport, Error> {
        self.run_update(conn, Some(count))
    }

    /// Reverse the latest `count` applied change sets, newest first.
    pub fn rollback(&self, conn: &mut Connection, count: usize) -> Result<RollbackReport, Error> {
        self.run_rollback(conn, |planner, state| planner.plan_rollback(state, count))
    }

    /// Reverse every change set applied after the latest one tagged `tag`.
    pub fn rollback_to_tag(&self, conn: &mut Connection, tag: &str) -> Result<RollbackReport, Error> {
        self.run_rollback(conn, |planner, state| planner.plan_rollback_to_tag(state, tag))
    }

    /// Effective records, oldest first.
    pub fn list_executed(&self, conn: &Connection) -> Result<Vec<ExecutionRecord>, Error> {
        self.tracker()?.list_executed(conn)
    }

    /// [Migrator::list_executed] as flat display rows.
    pub fn executed_rows(&self, conn: &Connection) -> Result<Vec<ChangeSetRow>, Error> {
        Ok(project(&self.list_executed(conn)?))
    }

    /// The full append-only tracking log.
    pub fn history(&self, conn: &Connection) -> Result<Vec<ExecutionRecord>, Error> {
        self.tracker()?.history(conn)
    }

    /// Record every pending change set as `MARK_RAN` without running it, for databases whose
    /// schema was brought up to date some other way.
    pub fn changelog_sync(&self, conn: &mut Connection) -> Result<Vec<ChangeSetKey>, Error> {
        let tracker = self.tracker()?;
        let lock = self.lock_service()?;
        conn.busy_timeout(self.config.busy_timeout)?;
        lock.with_lock(conn, |conn| {
            tracker.ensure_table(conn)?;
            let state = TrackerState::load(&tracker, conn)?;
            let planner = self.planner();
            planner.validate(&state)?;
            let deployment_id = new_deployment_id();

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut synced = Vec::new();
            for planned in planner.plan_update(&state, None) {
                let entry = NewExecution::for_change_set(planned.change_set, ExecType::MarkRan)
                    .description("changelog sync")
                    .deployment_id(&deployment_id);
                tracker
                    .record_execution(&tx, &entry)
                    .map_err(|source| Error::Tracking {
                        key: planned.change_set.key.clone(),
                        source,
                    })?;
                synced.push(planned.change_set.key.clone());
            }
            tx.commit()?;

            #[cfg(feature = "tracing")]
            tracing::info!(change_sets = synced.len(), "Marked pending change sets as ran");

            Ok(synced)
        })
    }

    /// Clear the change log lock whoever holds it. Returns whether it was held.
    pub fn release_locks(&self, conn: &Connection) -> Result<bool, Error> {
        self.lock_service()?.force_release(conn)
    }

    /// The live schema, without the tracking and lock tables.
    pub fn snapshot(&self, conn: &Connection) -> Result<SchemaSnapshot, Error> {
        SchemaSnapshot::capture(
            conn,
            &[
                self.config.changelog_table.as_str(),
                self.config.lock_table.as_str(),
            ],
        )
    }

    /// Compare the live schema against `baseline`. Read-only; takes no lock.
    pub fn diff(&self, conn: &Connection, baseline: &SchemaSnapshot) -> Result<DiffResult, Error> {
        Ok(compare(&self.snapshot(conn)?, baseline))
    }

    /// Drop every view and table in `schema` (`main` or an attached database name), including
    /// the tracking table. For `main` the lock table is dropped last, after the lock is released.
    /// Returns the dropped object names.
    pub fn drop_all(&self, conn: &mut Connection, schema: &str) -> Result<Vec<String>, Error> {
        validate_table_name(schema)?;
        let lock = self.lock_service()?;
        conn.busy_timeout(self.config.busy_timeout)?;
        let lock_table = self.config.lock_table.clone();

        let mut dropped = lock.with_lock(conn, |conn| {
            let objects: Vec<(String, String)> = conn
                .prepare(&format!(
                    "SELECT type, name FROM {}.sqlite_master
                     WHERE type IN ('view', 'table') AND name NOT LIKE 'sqlite_%'
                     ORDER BY type = 'table', name",
                    quote_ident(schema)
                ))?
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let keep = schema.eq_ignore_ascii_case("main").then_some(lock_table.as_str());
            without_foreign_keys(conn, |conn, _| drop_objects(conn, schema, &objects, keep))
        })?;

        // the lock table always lives in main
        if schema.eq_ignore_ascii_case("main") {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS main.{}", quote_ident(&lock_table)))?;
            dropped.push(lock_table);
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(schema = schema, objects = dropped.len(), "Dropped all database objects");

        Ok(dropped)
    }

    fn tracker(&self) -> Result<ExecutionTracker, Error> {
        ExecutionTracker::new(self.config.changelog_table.clone())
    }

    fn lock_service(&self) -> Result<LockService, Error> {
        self.config.validate()?;
        LockService::new(
            self.config.lock_table.clone(),
            self.config.lock_timeout,
            self.config.lock_poll_interval,
        )
    }

    fn planner(&self) -> MigrationPlanner<'_> {
        MigrationPlanner::new(&self.change_log, &self.registry).accept_drift(self.config.accept_drift)
    }

    fn run_update(&self, conn: &mut Connection, limit: Option<usize>) -> Result<UpdateReport, Error> {
        let tracker = self.tracker()?;
        let lock = self.lock_service()?;
        conn.busy_timeout(self.config.busy_timeout)?;

        lock.with_lock(conn, |conn| {
            let mut report = UpdateReport {
                tracking_table_existed: tracker.table_exists(conn)?,
                ..Default::default()
            };
            report.tracking_table_created = tracker.ensure_table(conn)?;

            let state = TrackerState::load(&tracker, conn)?;
            let planner = self.planner();
            planner.validate(&state)?;
            let plan = planner.plan_update(&state, limit);

            let deployment_id = new_deployment_id();
            let executor = Executor::new(&self.registry, &tracker)
                .transactional_ddl(self.config.transactional_ddl)
                .deployment_id(deployment_id.as_str());

            #[cfg(feature = "tracing")]
            tracing::info!(
                deployment_id = %deployment_id,
                pending = plan.len(),
                "Starting update"
            );

            for planned in plan {
                if self.cancellation.is_cancelled() {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Update cancelled");

                    report.cancelled = true;
                    break;
                }

                let key = &planned.change_set.key;
                #[cfg(feature = "tracing")]
                tracing::info!(change_set = %key, "Starting change set");

                if let Some(ref callback) = self.on_change_set_start {
                    callback(key);
                }
                let started = Instant::now();

                match executor.apply(conn, planned.change_set, planned.action) {
                    Ok(Outcome::Recorded(_)) => {
                        let duration = started.elapsed();

                        #[cfg(feature = "tracing")]
                        tracing::info!(
                            change_set = %key,
                            duration_ms = duration.as_millis(),
                            "Change set applied"
                        );

                        report.executed.push(key.clone());
                        if let Some(ref callback) = self.on_change_set_complete {
                            callback(key, duration);
                        }
                    }
                    Ok(Outcome::MarkedRan { reason, .. }) => {
                        report.marked_ran.push(key.clone());
                        if let Some(ref callback) = self.on_change_set_skipped {
                            callback(key, &reason);
                        }
                    }
                    Ok(Outcome::Skipped { reason }) => {
                        report.skipped.push(key.clone());
                        if let Some(ref callback) = self.on_change_set_skipped {
                            callback(key, &reason);
                        }
                    }
                    Ok(Outcome::Failed { error, .. }) => {
                        if let Some(ref callback) = self.on_change_set_error {
                            callback(key, &error);
                        }
                        report.failed.push(ChangeSetFailure {
                            key: key.clone(),
                            error,
                        });
                    }
                    Ok(Outcome::Unrecorded(warning)) => {
                        // the tracker no longer matches the schema, planning further is unsafe
                        report.warnings.push(warning);
                        break;
                    }
                    Err(error) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!(change_set = %key, error = %error, "Change set failed");

                        if let Some(ref callback) = self.on_change_set_error {
                            callback(key, &error);
                        }
                        report.failing_change_set = Some(ChangeSetFailure {
                            key: key.clone(),
                            error,
                        });
                        break;
                    }
                }
            }

            #[cfg(feature = "tracing")]
            tracing::info!(
                executed = report.executed.len(),
                marked_ran = report.marked_ran.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "Update finished"
            );

            Ok(report)
        })
    }

    fn run_rollback<'a>(
        &'a self,
        conn: &mut Connection,
        plan: impl FnOnce(&MigrationPlanner<'a>, &TrackerState) -> Result<Vec<PlannedRollback<'a>>, Error>,
    ) -> Result<RollbackReport, Error> {
        let tracker = self.tracker()?;
        let lock = self.lock_service()?;
        conn.busy_timeout(self.config.busy_timeout)?;

        lock.with_lock(conn, |conn| {
            let state = TrackerState::load(&tracker, conn)?;
            let planner = self.planner();
            planner.validate(&state)?;
            // planning fails as a whole before anything is reversed
            let plan = plan(&planner, &state)?;

            let executor = Executor::new(&self.registry, &tracker)
                .transactional_ddl(self.config.transactional_ddl)
                .deployment_id(new_deployment_id());

            #[cfg(feature = "tracing")]
            tracing::info!(planned = plan.len(), "Starting rollback");

            let mut report = RollbackReport::default();
            for planned in &plan {
                if self.cancellation.is_cancelled() {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Rollback cancelled");

                    report.cancelled = true;
                    break;
                }

                let key = &planned.record.key;
                #[cfg(feature = "tracing")]
                tracing::info!(change_set = %key, "Rolling back change set");

                if let Some(ref callback) = self.on_change_set_start {
                    callback(key);
                }
                let started = Instant::now();

                match executor.reverse(conn, planned) {
                    Ok(Outcome::Unrecorded(warning)) => {
                        report.warnings.push(warning);
                        break;
                    }
                    Ok(_) => {
                        let duration = started.elapsed();

                        #[cfg(feature = "tracing")]
                        tracing::info!(
                            change_set = %key,
                            duration_ms = duration.as_millis(),
                            "Change set rolled back"
                        );

                        report.rolled_back.push(key.clone());
                        if let Some(ref callback) = self.on_change_set_complete {
                            callback(key, duration);
                        }
                    }
                    Err(error) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!(change_set = %key, error = %error, "Rollback failed");

                        if let Some(ref callback) = self.on_change_set_error {
                            callback(key, &error);
                        }
                        report.failing_change_set = Some(ChangeSetFailure {
                            key: key.clone(),
                            error,
                        });
                        break;
                    }
                }
            }
            Ok(report)
        })
    }
}

fn new_deployment_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn drop_objects(
    conn: &Connection,
    schema: &str,
    objects: &[(String, String)],
    keep: Option<&str>,
) -> Result<Vec<String>, Error> {
    let mut dropped = Vec::new();
    for (kind, name) in objects {
        if keep == Some(name.as_str()) {
            continue;
        }
        let statement = if kind == "view" { "DROP VIEW" } else { "DROP TABLE" };
        conn.execute_batch(&format!(
            "{} IF EXISTS {}.{}",
            statement,
            quote_ident(schema),
            quote_ident(name)
        ))?;
        dropped.push(name.clone());
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const DOCUMENT: &str = r#"
databaseChangeLog:
  - changeSet:
      id: users
      author: alice
      tag: v1
      changes:
        - createTable:
            tableName: users
            columns:
              - { name: id, type: INTEGER, primaryKey: true }
              - { name: name, type: TEXT }
  - changeSet:
      id: email
      author: alice
      changes:
        - addColumn:
            tableName: users
            columns: [ { name: email, type: TEXT } ]
        - createIndex:
            indexName: users_email
            tableName: users
            columns: [email]
  - changeSet:
      id: posts
      author: bob
      tag: v2
      changes:
        - createTable:
            tableName: posts
            columns:
              - { name: id, type: INTEGER, primaryKey: true }
              - { name: user_id, type: INTEGER }
"#;

    fn migrator(document: &str) -> Migrator {
        Migrator::from_source(document, DocumentFormat::Yaml)
            .unwrap()
            .with_lock_timeout(Duration::from_millis(50))
    }

    fn tables(conn: &Connection) -> Vec<String> {
        conn.prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'quillbase_%' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
    }

    fn ids(keys: &[ChangeSetKey]) -> Vec<&str> {
        keys.iter().map(|k| k.id.as_str()).collect()
    }

    #[test]
    fn update_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = migrator(DOCUMENT);
        assert_eq!(migrator.status(&conn).unwrap().len(), 3);

        let first = migrator.update(&mut conn).unwrap();
        assert!(first.is_complete());
        assert!(!first.tracking_table_existed);
        assert!(first.tracking_table_created);
        assert_eq!(ids(&first.executed), vec!["users", "email", "posts"]);
        assert_eq!(tables(&conn), vec!["posts", "users"]);

        let second = migrator.update(&mut conn).unwrap();
        assert!(second.tracking_table_existed);
        assert!(!second.tracking_table_created);
        assert!(second.executed.is_empty());
        assert_eq!(migrator.history(&conn).unwrap().len(), 3);
        assert!(migrator.status(&conn).unwrap().is_empty());
        // the lock is free again
        assert!(!migrator.release_locks(&conn).unwrap());
    }

    #[test]
    fn update_count_applies_a_prefix() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = migrator(DOCUMENT);
        let report = migrator.update_count(&mut conn, 1).unwrap();
        assert_eq!(ids(&report.executed), vec!["users"]);
        let pending: Vec<String> = migrator
            .status(&conn)
            .unwrap()
            .iter()
            .map(|p| p.change_set.key.id.clone())
            .collect();
        assert_eq!(pending, vec!["email", "posts"]);
    }

    #[test]
    fn update_then_rollback_restores_the_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = migrator(DOCUMENT);
        let before = migrator.snapshot(&conn).unwrap();
        migrator.update(&mut conn).unwrap();

        let preview: Vec<String> = migrator
            .preview_rollback(&conn, 2)
            .unwrap()
            .iter()
            .map(|p| p.record.key.id.clone())
            .collect();
        assert_eq!(preview, vec!["posts", "email"]);

        let report = migrator.rollback(&mut conn, 3).unwrap();
        assert!(report.is_complete());
        assert_eq!(ids(&report.rolled_back), vec!["posts", "email", "users"]);
        assert_eq!(migrator.snapshot(&conn).unwrap(), before);
        assert!(migrator.list_executed(&conn).unwrap().is_empty());
        // history keeps every execution and reversal
        assert_eq!(migrator.history(&conn).unwrap().len(), 6);

        // and the change sets apply again
        let again = migrator.update(&mut conn).unwrap();
        assert_eq!(again.executed.len(), 3);
    }

    #[test]
    fn rollback_to_tag_keeps_the_tagged_change_set() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = migrator(DOCUMENT);
        migrator.update(&mut conn).unwrap();

        let report = migrator.rollback_to_tag(&mut conn, "v1").unwrap();
        assert_eq!(ids(&report.rolled_back), vec!["posts", "email"]);
        assert_eq!(tables(&conn), vec!["users"]);
        let executed: Vec<String> = migrator
            .executed_rows(&conn)
            .unwrap()
            .into_iter()
            .map(|row| row.id)
            .collect();
        assert_eq!(executed, vec!["users"]);

        assert!(matches!(
            migrator.rollback_to_tag(&mut conn, "v9"),
            Err(Error::TagNotFound(_))
        ));
    }

    #[test]
    fn rollback_without_definition_reverses_nothing() {
        let document = r#"
databaseChangeLog:
  - changeSet:
      id: users
      author: alice
      changes:
        - createTable:
            tableName: users
            columns: [ { name: id, type: INTEGER } ]
  - changeSet:
      id: seed
      author: alice
      changes:
        - sql: { sql: "INSERT INTO users (id) VALUES (1)" }
"#;
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = migrator(document);
        migrator.update(&mut conn).unwrap();

        assert!(matches!(
            migrator.rollback(&mut conn, 2),
            Err(Error::MissingRollbackDefinition { key }) if key.id == "seed"
        ));
        assert_eq!(migrator.list_executed(&conn).unwrap().len(), 2);
        assert_eq!(tables(&conn), vec!["users"]);
    }

    #[test]
    fn failing_change_set_stops_the_run_and_calls_hooks() {
        let document = r#"
databaseChangeLog:
  - changeSet:
      id: ok
      author: alice
      changes:
        - sql: { sql: "CREATE TABLE a (id INTEGER)" }
  - changeSet:
      id: broken
      author: alice
      changes:
        - sql: { sql: "CREATE TABLE b (id INTEGER)" }
        - sql: { sql: "INSERT INTO nowhere VALUES (1)" }
  - changeSet:
      id: never
      author: alice
      changes:
        - sql: { sql: "CREATE TABLE c (id INTEGER)" }
"#;
        let starts = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (starts_clone, completes_clone, errors_clone) =
            (Arc::clone(&starts), Arc::clone(&completes), Arc::clone(&errors));

        let migrator = migrator(document)
            .on_change_set_start(move |key| starts_clone.lock().unwrap().push(key.id.clone()))
            .on_change_set_complete(move |key, _| {
                completes_clone.lock().unwrap().push(key.id.clone())
            })
            .on_change_set_error(move |key, error| {
                errors_clone
                    .lock()
                    .unwrap()
                    .push((key.id.clone(), error.to_string()))
            });

        let mut conn = Connection::open_in_memory().unwrap();
        let report = migrator.update(&mut conn).unwrap();
        assert!(!report.is_complete());
        assert_eq!(ids(&report.executed), vec!["ok"]);
        let failure = report.failing_change_set.unwrap();
        assert_eq!(failure.key.id, "broken");
        assert!(matches!(
            failure.error,
            Error::Execution {
                operation_index: 1,
                ..
            }
        ));
        assert_eq!(tables(&conn), vec!["a"]);

        assert_eq!(*starts.lock().unwrap(), vec!["ok", "broken"]);
        assert_eq!(*completes.lock().unwrap(), vec!["ok"]);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].1.contains("nowhere"));
    }

    #[test]
    fn preconditions_report_marked_and_skipped_change_sets() {
        let document = r#"
databaseChangeLog:
  - changeSet:
      id: existing
      author: alice
      preconditions:
        onFail: MARK_RAN
        checks: [ { tableNotExists: { tableName: legacy } } ]
      changes:
        - sql: { sql: "CREATE TABLE legacy (id INTEGER)" }
  - changeSet:
      id: optional
      author: alice
      preconditions:
        onFail: CONTINUE
        checks: [ { tableExists: { tableName: feature_flags } } ]
      changes:
        - sql: { sql: "INSERT INTO feature_flags VALUES (1)" }
"#;
        let skipped = Arc::new(Mutex::new(Vec::new()));
        let skipped_clone = Arc::clone(&skipped);
        let migrator = migrator(document).on_change_set_skipped(move |key, reason| {
            skipped_clone
                .lock()
                .unwrap()
                .push((key.id.clone(), reason.to_string()))
        });

        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE legacy (id INTEGER)").unwrap();
        let report = migrator.update(&mut conn).unwrap();
        assert_eq!(ids(&report.marked_ran), vec!["existing"]);
        assert_eq!(ids(&report.skipped), vec!["optional"]);
        assert_eq!(skipped.lock().unwrap().len(), 2);

        // the skipped change set stays pending, the marked one does not
        let pending: Vec<String> = migrator
            .status(&conn)
            .unwrap()
            .iter()
            .map(|p| p.change_set.key.id.clone())
            .collect();
        assert_eq!(pending, vec!["optional"]);
    }

    #[test]
    fn tolerated_failures_continue_the_run() {
        let document = r#"
databaseChangeLog:
  - changeSet:
      id: optional
      author: alice
      failOnError: false
      changes:
        - sql: { sql: "INSERT INTO nowhere VALUES (1)" }
  - changeSet:
      id: next
      author: alice
      changes:
        - sql: { sql: "CREATE TABLE next (id INTEGER)" }
"#;
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = migrator(document);
        let report = migrator.update(&mut conn).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(ids(&report.executed), vec!["next"]);
        let history = migrator.history(&conn).unwrap();
        assert_eq!(history[0].exec_type, ExecType::Failed);
        // failed change sets are retried by the next update
        assert_eq!(migrator.status(&conn).unwrap().len(), 1);
    }

    #[test]
    fn cancellation_stops_before_the_next_change_set() {
        let token = CancellationToken::new();
        let cancel_after_first = token.clone();
        let migrator = migrator(DOCUMENT)
            .with_cancellation(token)
            .on_change_set_complete(move |_, _| cancel_after_first.cancel());

        let mut conn = Connection::open_in_memory().unwrap();
        let report = migrator.update(&mut conn).unwrap();
        assert!(report.cancelled);
        assert_eq!(ids(&report.executed), vec!["users"]);
        assert!(migrator.cancellation().is_cancelled());
    }

    #[test]
    fn modified_change_set_is_detected_as_drift() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrator(DOCUMENT).update(&mut conn).unwrap();

        let modified = DOCUMENT.replace("{ name: name, type: TEXT }", "{ name: name, type: BLOB }");
        let drifted = migrator(&modified);
        assert!(matches!(
            drifted.validate(&conn),
            Err(Error::ChecksumMismatch { key, .. }) if key.id == "users"
        ));
        assert!(matches!(
            drifted.update(&mut conn),
            Err(Error::ChecksumMismatch { .. })
        ));
        // the failed run released the lock
        assert!(!drifted.release_locks(&conn).unwrap());

        let tolerant = migrator(&modified).with_accept_drift(true);
        tolerant.validate(&conn).unwrap();
        assert!(tolerant.update(&mut conn).unwrap().executed.is_empty());
    }

    #[test]
    fn held_lock_times_out_until_released() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = migrator(DOCUMENT);
        let other = LockService::new(
            migrator.config().lock_table.clone(),
            Duration::from_millis(10),
            Duration::from_millis(5),
        )
        .unwrap()
        .with_holder("other-host");
        other.acquire(&conn).unwrap();

        match migrator.update(&mut conn) {
            Err(Error::LockTimeout { locked_by, .. }) => {
                assert_eq!(locked_by.as_deref(), Some("other-host"))
            }
            other => panic!("expected a lock timeout, got {:?}", other),
        }
        assert!(tables(&conn).is_empty());

        assert!(migrator.release_locks(&conn).unwrap());
        assert_eq!(migrator.update(&mut conn).unwrap().executed.len(), 3);
    }

    #[test]
    fn concurrent_updates_apply_each_change_set_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("app.db");
        let migrator = migrator(DOCUMENT).with_config(MigratorConfig {
            lock_timeout: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(5),
            ..MigratorConfig::default()
        });

        let reports: Vec<UpdateReport> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        let mut conn = Connection::open(&path).unwrap();
                        migrator.update(&mut conn).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let executed: usize = reports.iter().map(|r| r.executed.len()).sum();
        assert_eq!(executed, 3);
        assert!(reports.iter().any(|r| r.executed.is_empty()));

        let conn = Connection::open(&path).unwrap();
        let applied: Vec<String> = migrator
            .list_executed(&conn)
            .unwrap()
            .into_iter()
            .map(|r| r.key.id)
            .collect();
        assert_eq!(applied, vec!["users", "email", "posts"]);
        assert_eq!(migrator.history(&conn).unwrap().len(), 3);
    }

    #[test]
    fn changelog_sync_marks_everything_as_ran() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = migrator(DOCUMENT);
        let synced = migrator.changelog_sync(&mut conn).unwrap();
        assert_eq!(ids(&synced), vec!["users", "email", "posts"]);
        assert!(tables(&conn).is_empty());
        assert!(migrator.status(&conn).unwrap().is_empty());
        assert!(migrator
            .history(&conn)
            .unwrap()
            .iter()
            .all(|r| r.exec_type == ExecType::MarkRan));

        // marked change sets roll back without touching the schema
        let report = migrator.rollback(&mut conn, 3).unwrap();
        assert_eq!(report.rolled_back.len(), 3);
        assert_eq!(migrator.status(&conn).unwrap().len(), 3);
    }

    #[test]
    fn custom_table_names_are_used() {
        let mut conn = Connection::open_in_memory().unwrap();
        let custom = migrator(DOCUMENT)
            .with_changelog_table("app_changelog")
            .with_lock_table("app_lock");
        custom.update(&mut conn).unwrap();
        let names: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'app_%' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(names, vec!["app_changelog", "app_lock"]);

        let invalid = migrator(DOCUMENT).with_changelog_table("bad name");
        assert!(matches!(invalid.update(&mut conn), Err(Error::Config(_))));
    }

    #[test]
    fn diff_ignores_bookkeeping_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = migrator(DOCUMENT);
        migrator.update(&mut conn).unwrap();

        let baseline = migrator.snapshot(&conn).unwrap();
        assert_eq!(
            baseline.tables.keys().collect::<Vec<_>>(),
            vec!["posts", "users"]
        );
        assert!(migrator.diff(&conn, &baseline).unwrap().is_empty());

        conn.execute_batch("CREATE TABLE extra (id INTEGER)").unwrap();
        let diff = migrator.diff(&conn, &baseline).unwrap();
        assert_eq!(diff.added.len(), 1);
    }

    #[test]
    fn drop_all_removes_every_object() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = migrator(DOCUMENT);
        migrator.update(&mut conn).unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON; CREATE VIEW user_names AS SELECT name FROM users;")
            .unwrap();

        let dropped = migrator.drop_all(&mut conn, "main").unwrap();
        assert!(dropped.contains(&"user_names".to_string()));
        assert!(dropped.contains(&"quillbase_changelog".to_string()));
        assert_eq!(dropped.last().map(String::as_str), Some("quillbase_changelog_lock"));

        let remaining: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 0);
        let foreign_keys: bool = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert!(foreign_keys);

        // a fresh update starts from scratch
        assert_eq!(migrator.update(&mut conn).unwrap().executed.len(), 3);
    }

    #[test]
    #[cfg(feature = "tracing")]
    fn tracing_logs_applied_change_sets() {
        use tracing_test::traced_test;

        #[traced_test]
        fn run_test() {
            let mut conn = Connection::open_in_memory().unwrap();
            migrator(DOCUMENT).update(&mut conn).unwrap();

            assert!(logs_contain("Starting change set"));
            assert!(logs_contain("Change set applied"));
            assert!(logs_contain("duration_ms"));
        }

        run_test();
    }

    #[test]
    #[cfg(feature = "tracing")]
    fn tracing_logs_failed_change_sets() {
        use tracing_test::traced_test;

        #[traced_test]
        fn run_test() {
            let mut conn = Connection::open_in_memory().unwrap();
            let migrator = migrator(
                "databaseChangeLog:\n  - changeSet: { id: bad, author: a, changes: [ { sql: { sql: \"NOT SQL\" } } ] }\n",
            );
            let _ = migrator.update(&mut conn);

            assert!(logs_contain("Starting change set"));
            assert!(logs_contain("Change set failed"));
        }

        run_test();
    }
}
