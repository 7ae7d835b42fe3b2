use crate::changelog::ChangeSetKey;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;

/// Error type for the quillbase crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("cyclic include detected: {}", format_chain(.chain))]
    CyclicInclude { chain: Vec<PathBuf> },

    #[error(
        "change set {key} checksum mismatch. Recorded '{recorded}' but the change log now computes '{current}'. \
        This indicates the change set was modified after being applied."
    )]
    ChecksumMismatch {
        key: ChangeSetKey,
        recorded: String,
        current: String,
    },

    #[error("could not acquire the change log lock within {waited:?}{}", describe_holder(.locked_by, .locked_since))]
    LockTimeout {
        waited: Duration,
        locked_by: Option<String>,
        locked_since: Option<DateTime<Utc>>,
    },

    #[error("change set {key} has no rollback definition and its changes cannot be reversed automatically")]
    MissingRollbackDefinition { key: ChangeSetKey },

    #[error("change set {key} is recorded as executed but is not present in the change log")]
    UnknownChangeSet { key: ChangeSetKey },

    #[error("no executed change set carries tag '{0}'")]
    TagNotFound(String),

    #[error("precondition failed for change set {key}: {message}")]
    PreconditionFailed { key: ChangeSetKey, message: String },

    #[error("change set {key} failed at operation {operation_index} ({statement}): {source}")]
    Execution {
        key: ChangeSetKey,
        operation_index: usize,
        statement: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("change set {key} left a row in {table} without its parent in {parent}")]
    ForeignKeyViolation {
        key: ChangeSetKey,
        table: String,
        parent: String,
        rowid: Option<i64>,
    },

    #[error("failed to update the tracking table for change set {key}: {source}")]
    Tracking {
        key: ChangeSetKey,
        #[source]
        source: rusqlite::Error,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Reasons a change-log document is rejected before anything touches the database.
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("malformed change log {}: {message}", .path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("duplicate change set {key} (declared again in {})", .path.display())]
    DuplicateChangeSet { key: ChangeSetKey, path: PathBuf },

    #[error("cannot resolve include '{include}' from {}: {source}", .from.display())]
    UnresolvedInclude {
        from: PathBuf,
        include: String,
        #[source]
        source: std::io::Error,
    },

    #[error("change set {key} uses unknown change type '{kind}'")]
    UnknownChangeType { key: ChangeSetKey, kind: String },

    #[error("change set {key}, change {index} ({kind}): {message}")]
    InvalidChange {
        key: ChangeSetKey,
        index: usize,
        kind: String,
        message: String,
    },
}

/// The schema changes of a change set were committed but recording them in the tracking table failed.
///
/// The database and the tracker disagree until an operator reconciles them manually,
/// for example with `changelog_sync` or by restoring the tracking row.
#[derive(thiserror::Error, Debug)]
#[error("change set {key} was applied but could not be recorded: {source}")]
pub struct PartialApplyWarning {
    pub key: ChangeSetKey,
    #[source]
    pub source: rusqlite::Error,
}

fn format_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn describe_holder(locked_by: &Option<String>, locked_since: &Option<DateTime<Utc>>) -> String {
    match (locked_by, locked_since) {
        (Some(by), Some(since)) => format!(" (held by {} since {})", by, since.to_rfc3339()),
        (Some(by), None) => format!(" (held by {})", by),
        _ => String::new(),
    }
}
