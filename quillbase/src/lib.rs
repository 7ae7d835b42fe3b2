//! # Quillbase
//!
//! `quillbase` applies declarative change logs to SQLite databases. A change log is an
//! ordered list of uniquely keyed change sets written in YAML or JSON, possibly split over
//! included files. Applied change sets are recorded in an append-only tracking table together
//! with a checksum, so later edits are detected as drift, and every run is serialized by an
//! advisory lock table.
//!
//! ## Example
//!
//! ```
//! use quillbase::{DocumentFormat, Error, Migrator};
//! use rusqlite::Connection;
//!
//! # fn main() -> Result<(), Error> {
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
//!               - { name: name, type: TEXT, nullable: false }
//!   - changeSet:
//!       id: add-email
//!       author: alice
//!       changes:
//!         - addColumn:
//!             tableName: users
//!             columns: [ { name: email, type: TEXT } ]
//! "#,
//!     DocumentFormat::Yaml,
//! )?;
//!
//! // apply every pending change set, receiving a report of the results
//! let mut conn = Connection::open_in_memory()?;
//! let report = migrator.update(&mut conn)?;
//! assert!(report.tracking_table_created);
//! assert_eq!(report.executed.len(), 2);
//!
//! // each change set is reversed from its explicit rollback, or from its inferred inverse
//! let report = migrator.rollback(&mut conn, 1)?;
//! assert_eq!(report.rolled_back[0].id, "add-email");
//!
//! let columns = conn
//!     .prepare("SELECT name FROM pragma_table_info('users')")?
//!     .query_map([], |row| row.get::<_, String>(0))?
//!     .collect::<Result<Vec<_>, _>>()?;
//! assert_eq!(columns, vec!["id", "name"]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom change types
//!
//! Change types are resolved through a [ChangeRegistry]. Implement [ChangeType] and register
//! it next to the built-in ones, then parse with [Migrator::from_file_with_registry].
//!
//! ## Features
//!
//! - `tracing` (default): structured logs and spans for runs and change sets.
//! - `testing`: the [testing::TestHarness] for change-log tests in downstream crates.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod change;
pub use change::{Change, ChangeHandler, ChangeRegistry, ChangeType};

mod changelog;
pub use changelog::{ChangeLog, ChangeSet, ChangeSetKey};

pub mod checksum;

mod config;
pub use config::MigratorConfig;

mod diff;
pub use diff::{compare, DiffResult, GeneratedChangeLog, GeneratedChangeSet, SchemaObject};

mod error;
pub use error::{Error, ParseError, PartialApplyWarning};

mod executor;
pub use executor::{Executor, Outcome};

pub mod lock;

mod migrator;
pub use migrator::{
    CancellationToken, ChangeSetFailure, Migrator, RollbackReport, UpdateReport,
};

mod parser;
pub use parser::{ChangeLogParser, DocumentFormat};

mod planner;
pub use planner::{MigrationPlanner, PlannedAction, PlannedChangeSet, PlannedRollback};

pub mod precondition;

mod projection;
pub use projection::{project, ChangeSetRow};

pub mod snapshot;
pub use snapshot::SchemaSnapshot;

pub mod sql;

pub mod tracker;
pub use tracker::{ExecType, ExecutionRecord, ExecutionTracker, TrackerState};

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
