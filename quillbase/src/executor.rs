//! Applies a single change set, or reverses a single record, in its own transaction.
//!
//! With transactional DDL (the SQLite default) the tracking row is written inside the same
//! transaction as the schema changes, so a change set is either applied and recorded or
//! neither. Without it the row is written after the commit; a failure at that point leaves
//! the schema changed but unrecorded and is surfaced as a [PartialApplyWarning].

use crate::change::{Change, ChangeRegistry};
use crate::changelog::{ChangeSet, ChangeSetKey};
use crate::error::{Error, ParseError, PartialApplyWarning};
use crate::planner::{PlannedAction, PlannedRollback};
use crate::precondition::OnFail;
use crate::tracker::{ExecType, ExecutionRecord, ExecutionTracker, NewExecution};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

/// What happened to a change set handed to the [Executor].
#[derive(Debug)]
pub enum Outcome {
    /// Applied (or reversed) and recorded.
    Recorded(ExecutionRecord),
    /// A precondition with `onFail: MARK_RAN` did not hold. Nothing ran; a `MARK_RAN` row was written.
    MarkedRan {
        record: ExecutionRecord,
        reason: String,
    },
    /// A precondition with `onFail: CONTINUE` did not hold. Nothing ran or was recorded.
    Skipped { reason: String },
    /// The changes failed in a `failOnError: false` change set. The transaction was rolled
    /// back and a `FAILED` row was written.
    Failed {
        record: ExecutionRecord,
        error: Error,
    },
    /// The changes were committed but the tracking row could not be written.
    Unrecorded(PartialApplyWarning),
}

#[derive(Debug, Clone)]
pub struct Executor<'a> {
    registry: &'a ChangeRegistry,
    tracker: &'a ExecutionTracker,
    transactional_ddl: bool,
    deployment_id: Option<String>,
}

impl<'a> Executor<'a> {
    pub fn new(registry: &'a ChangeRegistry, tracker: &'a ExecutionTracker) -> Self {
        Self {
            registry,
            tracker,
            transactional_ddl: true,
            deployment_id: None,
        }
    }

    pub fn transactional_ddl(mut self, transactional_ddl: bool) -> Self {
        self.transactional_ddl = transactional_ddl;
        self
    }

    /// Stamp every row written by this executor with `deployment_id`.
    pub fn deployment_id(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }

    /// Run the change set's preconditions, then its changes, and record the result.
    ///
    /// A failing change in a `failOnError` change set (the default) rolls everything back,
    /// leaves the tracker untouched and returns [Error::Execution]. Foreign keys are not
    /// enforced while the changes run; with enforcement on they are checked before commit.
    pub fn apply(
        &self,
        conn: &mut Connection,
        change_set: &ChangeSet,
        action: PlannedAction,
    ) -> Result<Outcome, Error> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "change_set_apply",
            change_set = %change_set.key,
            action = ?action
        )
        .entered();

        without_foreign_keys(conn, |conn, enforced| {
            self.apply_within(conn, change_set, action, enforced)
        })
    }

    fn apply_within(
        &self,
        conn: &mut Connection,
        change_set: &ChangeSet,
        action: PlannedAction,
        enforced: bool,
    ) -> Result<Outcome, Error> {
        let description = self.describe(&change_set.changes);
        let entry = |exec_type: ExecType| {
            let entry = NewExecution::for_change_set(change_set, exec_type).description(&description);
            match &self.deployment_id {
                Some(id) => entry.deployment_id(id),
                None => entry,
            }
        };

        let changes_result = {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(preconditions) = &change_set.preconditions {
                if let Some(reason) = preconditions.evaluate(&tx)? {
                    match preconditions.on_fail {
                        OnFail::Halt => {
                            return Err(Error::PreconditionFailed {
                                key: change_set.key.clone(),
                                message: reason,
                            })
                        }
                        OnFail::MarkRan => {
                            #[cfg(feature = "tracing")]
                            tracing::info!(reason = %reason, "Precondition failed, marking change set as ran");

                            let record = self
                                .tracker
                                .record_execution(&tx, &entry(ExecType::MarkRan))
                                .map_err(|source| tracking_error(&change_set.key, source))?;
                            tx.commit()?;
                            return Ok(Outcome::MarkedRan { record, reason });
                        }
                        OnFail::Continue => {
                            #[cfg(feature = "tracing")]
                            tracing::info!(reason = %reason, "Precondition failed, skipping change set");

                            return Ok(Outcome::Skipped { reason });
                        }
                    }
                }
            }

            let ran = self
                .run_changes(&tx, &change_set.key, &change_set.changes)
                .and_then(|()| check_foreign_keys(&tx, &change_set.key, enforced));
            match ran {
                Ok(()) if self.transactional_ddl => {
                    let record = self
                        .tracker
                        .record_execution(&tx, &entry(action.exec_type()))
                        .map_err(|source| tracking_error(&change_set.key, source))?;
                    tx.commit()?;
                    return Ok(Outcome::Recorded(record));
                }
                Ok(()) => {
                    tx.commit()?;
                    Ok(())
                }
                // dropping the transaction rolls it back
                Err(error) => Err(error),
            }
        };

        match changes_result {
            Ok(()) => Ok(self.record_after_commit(change_set.key.clone(), || {
                self.tracker.record_execution(conn, &entry(action.exec_type()))
            })),
            Err(error) if !change_set.fail_on_error => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %error, "Change set failed, continuing because failOnError is false");

                let record = self
                    .tracker
                    .record_execution(conn, &entry(ExecType::Failed))
                    .map_err(|source| tracking_error(&change_set.key, source))?;
                Ok(Outcome::Failed { record, error })
            }
            Err(error) => Err(error),
        }
    }

    /// Run a planned rollback's changes and append the `ROLLED_BACK` marker.
    pub fn reverse(&self, conn: &mut Connection, planned: &PlannedRollback<'_>) -> Result<Outcome, Error> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "change_set_reverse",
            change_set = %planned.record.key,
            mark_only = planned.mark_only
        )
        .entered();

        without_foreign_keys(conn, |conn, enforced| self.reverse_within(conn, planned, enforced))
    }

    fn reverse_within(
        &self,
        conn: &mut Connection,
        planned: &PlannedRollback<'_>,
        enforced: bool,
    ) -> Result<Outcome, Error> {
        let key = &planned.record.key;
        let deployment_id = self.deployment_id.as_deref();
        {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !planned.mark_only {
                self.run_changes(&tx, key, &planned.changes)?;
                check_foreign_keys(&tx, key, enforced)?;
            }
            if self.transactional_ddl {
                let record = self
                    .tracker
                    .append_reversal(&tx, &planned.record, deployment_id)
                    .map_err(|source| tracking_error(key, source))?;
                tx.commit()?;
                return Ok(Outcome::Recorded(record));
            }
            tx.commit()?;
        }

        Ok(self.record_after_commit(key.clone(), || {
            self.tracker
                .append_reversal(conn, &planned.record, deployment_id)
        }))
    }

    /// Summary of the changes, stored as the record's description.
    pub fn describe(&self, changes: &[Change]) -> String {
        changes
            .iter()
            .map(|change| self.registry.describe(change))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn run_changes(&self, conn: &Connection, key: &ChangeSetKey, changes: &[Change]) -> Result<(), Error> {
        for (index, change) in changes.iter().enumerate() {
            let statements = self.registry.statements(change).map_err(|message| {
                ParseError::InvalidChange {
                    key: key.clone(),
                    index,
                    kind: change.kind.clone(),
                    message,
                }
            })?;
            for statement in statements {
                #[cfg(feature = "tracing")]
                tracing::debug!(operation = index, statement = %statement, "Executing statement");

                if let Err(source) = conn.execute_batch(&statement) {
                    #[cfg(feature = "tracing")]
                    tracing::error!(operation = index, error = %source, "Statement failed");

                    return Err(Error::Execution {
                        key: key.clone(),
                        operation_index: index,
                        statement,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    fn record_after_commit(
        &self,
        key: ChangeSetKey,
        write: impl FnOnce() -> rusqlite::Result<ExecutionRecord>,
    ) -> Outcome {
        match write() {
            Ok(record) => Outcome::Recorded(record),
            Err(source) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    change_set = %key,
                    error = %source,
                    "Changes were committed but the tracking table could not be updated"
                );

                Outcome::Unrecorded(PartialApplyWarning { key, source })
            }
        }
    }
}

/// Run `body` with foreign-key enforcement switched off, then restore it.
///
/// Rebuilding a table drops it, and with enforcement on that drop deletes (or cascades into)
/// every referencing row. The pragma is a no-op inside a transaction, so it has to wrap the
/// whole transaction. `body` is told whether enforcement was on so it can run
/// [check_foreign_keys] before committing.
pub(crate) fn without_foreign_keys<T>(
    conn: &mut Connection,
    body: impl FnOnce(&mut Connection, bool) -> Result<T, Error>,
) -> Result<T, Error> {
    let enforced: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    if enforced {
        conn.execute_batch("PRAGMA foreign_keys = OFF")?;
    }
    let result = body(conn, enforced);
    if enforced {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
    }
    result
}

/// Fail when `enforced` and the database holds a row whose parent is missing.
fn check_foreign_keys(conn: &Connection, key: &ChangeSetKey, enforced: bool) -> Result<(), Error> {
    if !enforced {
        return Ok(());
    }
    let violation = conn
        .query_row("PRAGMA foreign_key_check", [], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?, row.get::<_, String>(2)?))
        })
        .optional()?;
    match violation {
        Some((table, rowid, parent)) => {
            #[cfg(feature = "tracing")]
            tracing::error!(table = %table, parent = %parent, "Change set broke a foreign key");

            Err(Error::ForeignKeyViolation {
                key: key.clone(),
                table,
                parent,
                rowid,
            })
        }
        None => Ok(()),
    }
}

fn tracking_error(key: &ChangeSetKey, source: rusqlite::Error) -> Error {
    Error::Tracking {
        key: key.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeLog;
    use crate::parser::{ChangeLogParser, DocumentFormat};
    use crate::planner::MigrationPlanner;
    use crate::tracker::TrackerState;

    const DOCUMENT: &str = r#"
databaseChangeLog:
  - changeSet:
      id: users
      author: alice
      changes:
        - createTable:
            tableName: users
            columns:
              - { name: id, type: INTEGER, primaryKey: true }
              - { name: name, type: TEXT, nullable: false }
        - createIndex:
            indexName: users_name
            tableName: users
            columns: [name]
  - changeSet:
      id: broken
      author: alice
      changes:
        - createTable:
            tableName: posts
            columns: [ { name: id, type: INTEGER } ]
        - sql: { sql: "INSERT INTO missing_table VALUES (1)" }
  - changeSet:
      id: tolerated
      author: alice
      failOnError: false
      changes:
        - createTable:
            tableName: comments
            columns: [ { name: id, type: INTEGER } ]
        - sql: { sql: "INSERT INTO missing_table VALUES (1)" }
  - changeSet:
      id: halt
      author: alice
      preconditions:
        checks: [ { tableExists: { tableName: nowhere } } ]
      changes:
        - sql: { sql: "CREATE TABLE halted (id INTEGER)" }
  - changeSet:
      id: mark
      author: alice
      preconditions:
        onFail: MARK_RAN
        checks: [ { tableNotExists: { tableName: users } } ]
      changes:
        - sql: { sql: "CREATE TABLE marked (id INTEGER)" }
  - changeSet:
      id: continue
      author: alice
      preconditions:
        onFail: CONTINUE
        checks: [ { tableNotExists: { tableName: users } } ]
      changes:
        - sql: { sql: "CREATE TABLE continued (id INTEGER)" }
"#;

    struct Fixture {
        registry: ChangeRegistry,
        tracker: ExecutionTracker,
        change_log: ChangeLog,
        conn: Connection,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = ChangeRegistry::builtin();
            let change_log = ChangeLogParser::new(&registry)
                .parse_str(DOCUMENT, DocumentFormat::Yaml, ".", "changelog.yaml")
                .unwrap();
            let tracker = ExecutionTracker::default();
            let conn = Connection::open_in_memory().unwrap();
            tracker.ensure_table(&conn).unwrap();
            Self {
                registry,
                tracker,
                change_log,
                conn,
            }
        }

        fn change_set(&self, id: &str) -> &ChangeSet {
            self.change_log
                .iter()
                .find(|cs| cs.key.id == id)
                .unwrap()
        }

        fn table_exists(&self, table: &str) -> bool {
            self.conn
                .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1")
                .unwrap()
                .exists([table])
                .unwrap()
        }
    }

    fn apply(fixture: &mut Fixture, id: &str) -> Result<Outcome, Error> {
        let executor = Executor::new(&fixture.registry, &fixture.tracker).deployment_id("run-1");
        let change_set = fixture
            .change_log
            .iter()
            .find(|cs| cs.key.id == id)
            .unwrap();
        executor.apply(&mut fixture.conn, change_set, PlannedAction::Execute)
    }

    #[test]
    fn applies_and_records_in_one_transaction() {
        let mut fixture = Fixture::new();
        match apply(&mut fixture, "users").unwrap() {
            Outcome::Recorded(record) => {
                assert_eq!(record.exec_type, ExecType::Executed);
                assert_eq!(record.deployment_id.as_deref(), Some("run-1"));
                assert_eq!(record.checksum, fixture.change_set("users").checksum);
                assert!(record.description.unwrap().contains("users"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(fixture.table_exists("users"));
        assert_eq!(fixture.tracker.history(&fixture.conn).unwrap().len(), 1);
    }

    #[test]
    fn failure_rolls_back_and_leaves_tracker_untouched() {
        let mut fixture = Fixture::new();
        match apply(&mut fixture, "broken") {
            Err(Error::Execution {
                key,
                operation_index,
                statement,
                ..
            }) => {
                assert_eq!(key.id, "broken");
                assert_eq!(operation_index, 1);
                assert!(statement.contains("missing_table"));
            }
            other => panic!("expected an execution error, got {:?}", other),
        }
        assert!(!fixture.table_exists("posts"));
        assert!(fixture.tracker.history(&fixture.conn).unwrap().is_empty());
    }

    #[test]
    fn tolerated_failure_is_recorded_as_failed() {
        let mut fixture = Fixture::new();
        match apply(&mut fixture, "tolerated").unwrap() {
            Outcome::Failed { record, error } => {
                assert_eq!(record.exec_type, ExecType::Failed);
                assert!(matches!(error, Error::Execution { .. }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!fixture.table_exists("comments"));
        let state = TrackerState::load(&fixture.tracker, &fixture.conn).unwrap();
        assert!(!state.is_applied(&fixture.change_set("tolerated").key));
    }

    #[test]
    fn preconditions_halt_mark_ran_or_skip() {
        let mut fixture = Fixture::new();
        apply(&mut fixture, "users").unwrap();

        assert!(matches!(
            apply(&mut fixture, "halt"),
            Err(Error::PreconditionFailed { key, .. }) if key.id == "halt"
        ));
        assert!(!fixture.table_exists("halted"));

        match apply(&mut fixture, "mark").unwrap() {
            Outcome::MarkedRan { record, reason } => {
                assert_eq!(record.exec_type, ExecType::MarkRan);
                assert!(reason.contains("users"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!fixture.table_exists("marked"));

        assert!(matches!(
            apply(&mut fixture, "continue").unwrap(),
            Outcome::Skipped { .. }
        ));
        assert!(!fixture.table_exists("continued"));

        let history = fixture.tracker.history(&fixture.conn).unwrap();
        let ids: Vec<&str> = history.iter().map(|r| r.key.id.as_str()).collect();
        assert_eq!(ids, vec!["users", "mark"]);
    }

    #[test]
    fn tracker_failure_outside_transaction_is_a_partial_apply() {
        let mut fixture = Fixture::new();
        fixture
            .conn
            .execute_batch(
                "CREATE TRIGGER tracker_offline BEFORE INSERT ON quillbase_changelog
                 BEGIN SELECT RAISE(ABORT, 'tracker offline'); END;",
            )
            .unwrap();

        let executor = Executor::new(&fixture.registry, &fixture.tracker).transactional_ddl(false);
        let change_set = fixture.change_log.iter().next().unwrap().clone();
        match executor
            .apply(&mut fixture.conn, &change_set, PlannedAction::Execute)
            .unwrap()
        {
            Outcome::Unrecorded(warning) => assert_eq!(warning.key.id, "users"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(fixture.table_exists("users"));
        assert!(fixture.tracker.history(&fixture.conn).unwrap().is_empty());
    }

    #[test]
    fn tracker_failure_inside_transaction_rolls_back_the_changes() {
        let mut fixture = Fixture::new();
        fixture
            .conn
            .execute_batch(
                "CREATE TRIGGER tracker_offline BEFORE INSERT ON quillbase_changelog
                 BEGIN SELECT RAISE(ABORT, 'tracker offline'); END;",
            )
            .unwrap();

        assert!(matches!(
            apply(&mut fixture, "users"),
            Err(Error::Tracking { .. })
        ));
        assert!(!fixture.table_exists("users"));
    }

    #[test]
    fn reverse_runs_inverse_changes_and_appends_marker() {
        let mut fixture = Fixture::new();
        apply(&mut fixture, "users").unwrap();

        let state = TrackerState::load(&fixture.tracker, &fixture.conn).unwrap();
        let planner = MigrationPlanner::new(&fixture.change_log, &fixture.registry);
        let plan = planner.plan_rollback(&state, 1).unwrap();
        let executor = Executor::new(&fixture.registry, &fixture.tracker);
        match executor.reverse(&mut fixture.conn, &plan[0]).unwrap() {
            Outcome::Recorded(record) => assert_eq!(record.exec_type, ExecType::RolledBack),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!fixture.table_exists("users"));
        assert_eq!(fixture.tracker.history(&fixture.conn).unwrap().len(), 2);
        assert!(fixture
            .tracker
            .list_executed(&fixture.conn)
            .unwrap()
            .is_empty());
    }

    const PARENTS: &str = "
        PRAGMA foreign_keys = ON;
        CREATE TABLE parents (id INTEGER PRIMARY KEY, name TEXT);
        CREATE TABLE children (
            id INTEGER PRIMARY KEY,
            parent_id INTEGER REFERENCES parents (id) ON DELETE CASCADE
        );
        INSERT INTO parents (id, name) VALUES (1, 'root');
        INSERT INTO children (id, parent_id) VALUES (1, 1);
    ";

    fn single_change_set(registry: &ChangeRegistry, changes: &str) -> ChangeLog {
        let document = format!(
            "databaseChangeLog:\n  - changeSet:\n      id: one\n      author: alice\n      changes:\n{}",
            changes
        );
        ChangeLogParser::new(registry)
            .parse_str(&document, DocumentFormat::Yaml, ".", "changelog.yaml")
            .unwrap()
    }

    fn foreign_keys_enforced(conn: &Connection) -> bool {
        conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn replacing_a_referenced_table_keeps_child_rows() {
        let registry = ChangeRegistry::builtin();
        let tracker = ExecutionTracker::default();
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(PARENTS).unwrap();
        tracker.ensure_table(&conn).unwrap();
        let change_log = single_change_set(
            &registry,
            r#"        - sql: { sql: "CREATE TABLE parents_new (name TEXT, id INTEGER PRIMARY KEY)" }
        - sql: { sql: "INSERT INTO parents_new (name, id) SELECT name, id FROM parents" }
        - dropTable: { tableName: parents }
        - renameTable: { oldTableName: parents_new, newTableName: parents }
"#,
        );

        let executor = Executor::new(&registry, &tracker);
        let outcome = executor
            .apply(&mut conn, &change_log.change_sets()[0], PlannedAction::Execute)
            .unwrap();
        assert!(matches!(outcome, Outcome::Recorded(_)));

        let children: i64 = conn
            .query_row("SELECT COUNT(*) FROM children", [], |row| row.get(0))
            .unwrap();
        assert_eq!(children, 1);
        assert!(foreign_keys_enforced(&conn));
    }

    #[test]
    fn orphaned_rows_fail_the_change_set() {
        let registry = ChangeRegistry::builtin();
        let tracker = ExecutionTracker::default();
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(PARENTS).unwrap();
        tracker.ensure_table(&conn).unwrap();
        let change_log = single_change_set(
            &registry,
            "        - sql: { sql: \"DELETE FROM parents\" }\n",
        );

        let executor = Executor::new(&registry, &tracker);
        let result = executor.apply(&mut conn, &change_log.change_sets()[0], PlannedAction::Execute);
        assert!(
            matches!(&result, Err(Error::ForeignKeyViolation { table, parent, .. }) if table == "children" && parent == "parents"),
            "{:?}",
            result
        );

        let parents: i64 = conn
            .query_row("SELECT COUNT(*) FROM parents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(parents, 1);
        assert!(tracker.history(&conn).unwrap().is_empty());
        assert!(foreign_keys_enforced(&conn));
    }
}
