//! Change-set preconditions, evaluated against the live database before a change set runs.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What to do when a precondition does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnFail {
    /// Stop the run with a precondition error.
    #[default]
    Halt,
    /// Record the change set as ran without executing it.
    MarkRan,
    /// Skip the change set for this run without recording anything.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Preconditions {
    #[serde(default)]
    pub on_fail: OnFail,
    pub checks: Vec<PreconditionCheck>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreconditionCheck {
    #[serde(rename_all = "camelCase")]
    TableExists { table_name: String },
    #[serde(rename_all = "camelCase")]
    TableNotExists { table_name: String },
    #[serde(rename_all = "camelCase")]
    ColumnExists {
        table_name: String,
        column_name: String,
    },
    #[serde(rename_all = "camelCase")]
    IndexExists { index_name: String },
    /// Runs `sql` and compares the first column of the first row, as text, with `expected_result`.
    #[serde(rename_all = "camelCase")]
    SqlCheck { sql: String, expected_result: Value },
}

impl PreconditionCheck {
    /// Evaluate the check. Returns a description of the failure, or `None` when it holds.
    pub fn evaluate(&self, conn: &Connection) -> rusqlite::Result<Option<String>> {
        match self {
            Self::TableExists { table_name } => Ok((!object_exists(conn, "table", table_name)?)
                .then(|| format!("table '{}' does not exist", table_name))),
            Self::TableNotExists { table_name } => Ok(object_exists(conn, "table", table_name)?
                .then(|| format!("table '{}' already exists", table_name))),
            Self::IndexExists { index_name } => Ok((!object_exists(conn, "index", index_name)?)
                .then(|| format!("index '{}' does not exist", index_name))),
            Self::ColumnExists {
                table_name,
                column_name,
            } => {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
                    [table_name, column_name],
                    |row| row.get(0),
                )?;
                Ok((count == 0)
                    .then(|| format!("column '{}.{}' does not exist", table_name, column_name)))
            }
            Self::SqlCheck {
                sql,
                expected_result,
            } => {
                let actual: rusqlite::types::Value = conn.query_row(sql, [], |row| row.get(0))?;
                let actual = value_text(&actual);
                let expected = match expected_result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Ok((actual != expected).then(|| {
                    format!(
                        "sqlCheck returned '{}' but '{}' was expected",
                        actual, expected
                    )
                }))
            }
        }
    }
}

impl Preconditions {
    /// The first failing check's description, or `None` when every check holds.
    pub fn evaluate(&self, conn: &Connection) -> rusqlite::Result<Option<String>> {
        for check in &self.checks {
            if let Some(failure) = check.evaluate(conn)? {
                return Ok(Some(failure));
            }
        }
        Ok(None)
    }
}

fn object_exists(conn: &Connection, kind: &str, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
        [kind, name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn value_text(value: &rusqlite::types::Value) -> String {
    use rusqlite::types::Value as V;
    match value {
        V::Null => "null".to_string(),
        V::Integer(i) => i.to_string(),
        V::Real(r) => r.to_string(),
        V::Text(s) => s.clone(),
        V::Blob(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
             CREATE INDEX idx_users_email ON users (email);
             INSERT INTO users (email) VALUES ('a@example.com');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn schema_checks() {
        let conn = conn();
        let holds = |check: PreconditionCheck| check.evaluate(&conn).unwrap().is_none();

        assert!(holds(PreconditionCheck::TableExists {
            table_name: "users".into()
        }));
        assert!(!holds(PreconditionCheck::TableExists {
            table_name: "orders".into()
        }));
        assert!(holds(PreconditionCheck::TableNotExists {
            table_name: "orders".into()
        }));
        assert!(holds(PreconditionCheck::ColumnExists {
            table_name: "users".into(),
            column_name: "email".into()
        }));
        assert!(!holds(PreconditionCheck::ColumnExists {
            table_name: "users".into(),
            column_name: "name".into()
        }));
        assert!(holds(PreconditionCheck::IndexExists {
            index_name: "idx_users_email".into()
        }));
    }

    #[test]
    fn sql_check_compares_as_text() {
        let conn = conn();
        let check = |expected: Value| {
            PreconditionCheck::SqlCheck {
                sql: "SELECT COUNT(*) FROM users".into(),
                expected_result: expected,
            }
            .evaluate(&conn)
            .unwrap()
        };
        assert_eq!(check(Value::from(1)), None);
        assert_eq!(check(Value::from("1")), None);
        assert!(check(Value::from(0)).unwrap().contains("returned '1'"));
    }

    #[test]
    fn deserializes_document_form() {
        let yaml = "onFail: MARK_RAN\nchecks:\n  - tableExists: { tableName: users }\n  - sqlCheck: { sql: SELECT 1, expectedResult: 1 }\n";
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        let preconditions: Preconditions = serde_json::from_value(value).unwrap();
        assert_eq!(preconditions.on_fail, OnFail::MarkRan);
        assert_eq!(preconditions.checks.len(), 2);
        assert_eq!(
            preconditions.checks[0],
            PreconditionCheck::TableExists {
                table_name: "users".into()
            }
        );
    }
}
