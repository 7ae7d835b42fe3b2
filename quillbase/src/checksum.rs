//! Content checksums for change sets.
//!
//! A checksum covers the kind and parameters of every change, in order, and nothing else:
//! ids, authors, comments and rollback blocks can be edited without invalidating an applied
//! change set. Parameters are hashed in a canonical form (object keys sorted, no formatting),
//! and the text of `sql` changes is normalized with [crate::sql::normalize], so whitespace
//! and comment edits in raw SQL do not count as drift either.
//!
//! Checksums are rendered as `<version>:<sha256 hex>`. The version prefix lets the algorithm
//! change later without every recorded checksum turning into a mismatch.

use crate::change::Change;
use crate::sql;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Version prefix of checksums produced by [compute].
pub const CHECKSUM_VERSION: u32 = 1;

/// Checksum of an ordered list of changes.
pub fn compute(changes: &[Change]) -> String {
    let mut hasher = Sha256::new();
    for change in changes {
        let mut canonical = String::new();
        canonical.push_str(&change.kind);
        canonical.push('|');
        write_canonical(&mut canonical, &normalized_params(change));
        canonical.push('\n');
        hasher.update(canonical.as_bytes());
    }
    format!("{}:{:x}", CHECKSUM_VERSION, hasher.finalize())
}

fn normalized_params(change: &Change) -> Value {
    let mut params = change.params.clone();
    if change.kind == "sql" {
        if let Some(Value::String(text)) = params.get_mut("sql") {
            *text = sql::normalize(text);
        }
    }
    params
}

// serde_json's map ordering depends on crate features, so ordering is done here.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(out, &map[key.as_str()]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_users(column_type: &str) -> Vec<Change> {
        vec![Change::new(
            "createTable",
            json!({"tableName": "users", "columns": [{"name": "id", "type": column_type}]}),
        )]
    }

    #[test]
    fn checksum_is_versioned_sha256() {
        let checksum = compute(&create_users("INTEGER"));
        let (version, digest) = checksum.split_once(':').unwrap();
        assert_eq!(version, "1");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn checksum_ignores_key_order() {
        let a = vec![Change::new("dropTable", json!({"tableName": "t", "ifExists": true}))];
        let b: Vec<Change> =
            serde_yaml::from_str("- dropTable:\n    ifExists: true\n    tableName: t\n").unwrap();
        assert_eq!(compute(&a), compute(&b));
    }

    #[test]
    fn checksum_changes_with_any_parameter() {
        assert_ne!(compute(&create_users("INTEGER")), compute(&create_users("TEXT")));
        assert_ne!(compute(&create_users("INTEGER")), compute(&[]));
    }

    #[test]
    fn checksum_depends_on_change_order() {
        let first = Change::new("dropIndex", json!({"indexName": "a"}));
        let second = Change::new("dropIndex", json!({"indexName": "b"}));
        assert_ne!(
            compute(&[first.clone(), second.clone()]),
            compute(&[second, first])
        );
    }

    #[test]
    fn sql_formatting_is_not_drift() {
        let compact = vec![Change::new("sql", json!({"sql": "UPDATE users SET active = 1"}))];
        let formatted = vec![Change::new(
            "sql",
            json!({"sql": "-- activate everyone\nUPDATE users\n   SET active = 1;\n"}),
        )];
        let changed = vec![Change::new("sql", json!({"sql": "UPDATE users SET active = 0"}))];
        assert_eq!(compute(&compact), compute(&formatted));
        assert_ne!(compute(&compact), compute(&changed));
    }
}
