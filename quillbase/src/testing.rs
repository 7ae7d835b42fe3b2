//! Testing utilities for change-log development and verification.
//!
//! Available in this crate's own tests and, for downstream crates, behind the `testing` feature.

use crate::diff::compare;
use crate::migrator::{Migrator, RollbackReport, UpdateReport};
use crate::snapshot::SchemaSnapshot;
use crate::Error;
use rusqlite::{Connection, Row};

/// A test harness pairing a [Migrator] with a database, with state control and assertion helpers.
///
/// # Example
///
/// ```
/// # #[cfg(not(feature = "testing"))]
/// # fn main() {}
/// # #[cfg(feature = "testing")]
/// # fn main() -> Result<(), quillbase::Error> {
/// use quillbase::testing::TestHarness;
/// use quillbase::{DocumentFormat, Migrator};
///
/// let migrator = Migrator::from_source(
///     r#"
/// databaseChangeLog:
///   - changeSet:
///       id: users
///       author: alice
///       changes:
///         - createTable:
///             tableName: users
///             columns:
///               - { name: id, type: INTEGER, primaryKey: true }
///               - { name: name, type: TEXT }
/// "#,
///     DocumentFormat::Yaml,
/// )?;
/// let mut harness = TestHarness::new(migrator)?;
///
/// harness.update()?;
/// harness.execute("INSERT INTO users VALUES (1, 'alice')")?;
/// harness.assert_table_exists("users")?;
///
/// let name: String = harness.query_one("SELECT name FROM users WHERE id = 1")?;
/// assert_eq!(name, "alice");
///
/// harness.rollback(1)?;
/// harness.assert_table_not_exists("users")?;
/// # Ok(())
/// # }
/// ```
pub struct TestHarness {
    conn: Connection,
    migrator: Migrator,
}

impl TestHarness {
    /// Create a harness over an in-memory SQLite database.
    pub fn new(migrator: Migrator) -> Result<Self, Error> {
        Ok(Self::with_connection(Connection::open_in_memory()?, migrator))
    }

    /// Create a harness with a custom connection, e.g. a file-based database.
    pub fn with_connection(conn: Connection, migrator: Migrator) -> Self {
        Self { conn, migrator }
    }

    /// Apply every pending change set. A stopped or cancelled run is an error.
    pub fn update(&mut self) -> Result<UpdateReport, Error> {
        let report = self.migrator.update(&mut self.conn)?;
        complete_update(report)
    }

    /// Apply at most `count` pending change sets.
    pub fn update_count(&mut self, count: usize) -> Result<UpdateReport, Error> {
        let report = self.migrator.update_count(&mut self.conn, count)?;
        complete_update(report)
    }

    /// Reverse the latest `count` change sets. A stopped or cancelled run is an error.
    pub fn rollback(&mut self, count: usize) -> Result<RollbackReport, Error> {
        let report = self.migrator.rollback(&mut self.conn, count)?;
        complete_rollback(report)
    }

    pub fn rollback_to_tag(&mut self, tag: &str) -> Result<RollbackReport, Error> {
        let report = self.migrator.rollback_to_tag(&mut self.conn, tag)?;
        complete_rollback(report)
    }

    /// Ids of the change sets an update would apply.
    pub fn pending(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .migrator
            .status(&self.conn)?
            .iter()
            .map(|planned| planned.change_set.key.id.clone())
            .collect())
    }

    /// Execute a SQL statement (for setting up test data).
    pub fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.execute(sql, [])?;
        Ok(())
    }

    /// Query a single value from the database.
    pub fn query_one<T>(&mut self, sql: &str) -> Result<T, Error>
    where
        T: rusqlite::types::FromSql,
    {
        let result = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(result)
    }

    /// Query all values from a single-column result.
    pub fn query_all<T>(&mut self, sql: &str) -> Result<Vec<T>, Error>
    where
        T: rusqlite::types::FromSql,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    /// Query with a custom row mapper.
    pub fn query_map<T, F>(&mut self, sql: &str, f: F) -> Result<Vec<T>, Error>
    where
        F: FnMut(&Row) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt.query_map([], f)?.collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    pub fn assert_table_exists(&mut self, table_name: &str) -> Result<(), Error> {
        if !self.object_exists("table", table_name)? {
            return Err(Error::Generic(format!("Table '{}' does not exist", table_name)));
        }
        Ok(())
    }

    pub fn assert_table_not_exists(&mut self, table_name: &str) -> Result<(), Error> {
        if self.object_exists("table", table_name)? {
            return Err(Error::Generic(format!(
                "Table '{}' exists but should not",
                table_name
            )));
        }
        Ok(())
    }

    pub fn assert_column_exists(&mut self, table_name: &str, column_name: &str) -> Result<(), Error> {
        let snapshot = self.capture_schema()?;
        let exists = snapshot
            .tables
            .get(table_name)
            .is_some_and(|table| table.column(column_name).is_some());
        if !exists {
            return Err(Error::Generic(format!(
                "Column '{}' does not exist in table '{}'",
                column_name, table_name
            )));
        }
        Ok(())
    }

    pub fn assert_index_exists(&mut self, index_name: &str) -> Result<(), Error> {
        if !self.object_exists("index", index_name)? {
            return Err(Error::Generic(format!("Index '{}' does not exist", index_name)));
        }
        Ok(())
    }

    /// Capture the current schema, without the tracking and lock tables.
    pub fn capture_schema(&mut self) -> Result<SchemaSnapshot, Error> {
        self.migrator.snapshot(&self.conn)
    }

    /// Assert that the current schema matches a previously captured snapshot.
    pub fn assert_schema_matches(&mut self, expected: &SchemaSnapshot) -> Result<(), Error> {
        let diff = compare(&self.capture_schema()?, expected);
        if diff.is_empty() {
            return Ok(());
        }

        let mut differences = Vec::new();
        differences.extend(diff.removed.iter().map(|o| format!("  - Missing {}", o)));
        differences.extend(diff.added.iter().map(|o| format!("  - Unexpected {}", o)));
        differences.extend(diff.changed.iter().map(|o| format!("  - Changed {}", o)));
        Err(Error::Generic(format!(
            "Schema mismatch detected:\n{}",
            differences.join("\n")
        )))
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    /// Get a reference to the underlying connection for advanced usage.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn object_exists(&self, kind: &str, name: &str) -> Result<bool, Error> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
            [kind, name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn complete_update(mut report: UpdateReport) -> Result<UpdateReport, Error> {
    if let Some(failure) = report.failing_change_set.take() {
        return Err(failure.error);
    }
    if let Some(warning) = report.warnings.first() {
        return Err(Error::Generic(warning.to_string()));
    }
    if report.cancelled {
        return Err(Error::Generic("update was cancelled".to_string()));
    }
    Ok(report)
}

fn complete_rollback(mut report: RollbackReport) -> Result<RollbackReport, Error> {
    if let Some(failure) = report.failing_change_set.take() {
        return Err(failure.error);
    }
    if let Some(warning) = report.warnings.first() {
        return Err(Error::Generic(warning.to_string()));
    }
    if report.cancelled {
        return Err(Error::Generic("rollback was cancelled".to_string()));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::DocumentFormat;

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
              - { name: name, type: TEXT }
  - changeSet:
      id: email
      author: alice
      tag: with-email
      changes:
        - addColumn:
            tableName: users
            columns: [ { name: email, type: TEXT } ]
        - createIndex:
            indexName: idx_users_email
            tableName: users
            columns: [email]
  - changeSet:
      id: backfill
      author: alice
      changes:
        - sql: { sql: "UPDATE users SET email = lower(name) || '@example.com' WHERE email IS NULL" }
      rollback:
        - sql: { sql: "UPDATE users SET email = NULL" }
"#;

    fn harness() -> TestHarness {
        TestHarness::new(Migrator::from_source(DOCUMENT, DocumentFormat::Yaml).unwrap()).unwrap()
    }

    #[test]
    fn data_survives_a_step_by_step_update() {
        let mut harness = harness();
        harness.update_count(1).unwrap();
        harness.assert_table_exists("users").unwrap();
        harness.execute("INSERT INTO users (id, name) VALUES (1, 'Alice')").unwrap();
        assert_eq!(harness.pending().unwrap(), vec!["email", "backfill"]);

        harness.update().unwrap();
        harness.assert_column_exists("users", "email").unwrap();
        harness.assert_index_exists("idx_users_email").unwrap();
        let email: String = harness
            .query_one("SELECT email FROM users WHERE id = 1")
            .unwrap();
        assert_eq!(email, "alice@example.com");
        assert!(harness.pending().unwrap().is_empty());
    }

    #[test]
    fn rollback_to_tag_restores_the_earlier_schema() {
        let mut harness = harness();
        harness.update_count(2).unwrap();
        let tagged = harness.capture_schema().unwrap();

        harness.update().unwrap();
        harness.execute("INSERT INTO users (id, name) VALUES (1, 'Bob')").unwrap();
        let report = harness.rollback_to_tag("with-email").unwrap();
        assert_eq!(report.rolled_back.len(), 1);
        harness.assert_schema_matches(&tagged).unwrap();

        let emails: Vec<Option<String>> = harness.query_all("SELECT email FROM users").unwrap();
        assert_eq!(emails, vec![None]);
    }

    #[test]
    fn full_rollback_is_reversible() {
        let mut harness = harness();
        let empty = harness.capture_schema().unwrap();
        harness.update().unwrap();
        harness.rollback(3).unwrap();
        harness.assert_schema_matches(&empty).unwrap();
        harness.assert_table_not_exists("users").unwrap();
    }

    #[test]
    fn schema_mismatch_lists_differences() {
        let mut harness = harness();
        harness.update_count(1).unwrap();
        let before = harness.capture_schema().unwrap();
        harness.update_count(1).unwrap();

        let message = harness.assert_schema_matches(&before).unwrap_err().to_string();
        assert!(message.contains("Schema mismatch detected"));
        assert!(message.contains("column users.email"), "{}", message);
    }

    #[test]
    fn failed_assertions_are_errors() {
        let mut harness = harness();
        assert!(harness.assert_table_exists("users").is_err());
        assert!(harness.assert_column_exists("users", "id").is_err());
        assert!(harness.assert_index_exists("idx_users_email").is_err());
        harness.update().unwrap();
        assert!(harness.assert_table_not_exists("users").is_err());
        assert!(harness.assert_column_exists("users", "missing").is_err());
    }

    #[test]
    fn failing_change_sets_surface_their_error() {
        let migrator = Migrator::from_source(
            "databaseChangeLog:\n  - changeSet: { id: bad, author: a, changes: [ { sql: { sql: \"DROP TABLE nowhere\" } } ] }\n",
            DocumentFormat::Yaml,
        )
        .unwrap();
        let mut harness = TestHarness::new(migrator).unwrap();
        assert!(matches!(harness.update(), Err(Error::Execution { .. })));

        let rows = harness
            .query_map("SELECT exec_type FROM quillbase_changelog", |row| row.get::<_, String>(0))
            .unwrap();
        assert!(rows.is_empty());
    }
}
