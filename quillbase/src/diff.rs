//! Structural comparison of two schema snapshots, and rendering of the difference as a change log.
//!
//! The comparison is purely structural and independent of execution history. The rendered
//! change log transforms the *baseline* into the *live* schema: tables that only exist live
//! are created, tables that only exist in the baseline are dropped, and tables present in
//! both are altered in place when SQLite's `ALTER TABLE` can express the change, or rebuilt
//! otherwise (create a temporary table, copy the common columns, drop, rename).

use crate::change::{
    AddColumn, AddColumnParams, Change, ColumnDef, CreateIndex, CreateIndexParams, CreateTable,
    CreateTableParams, DropColumn, DropColumnParams, DropIndex, DropIndexParams, DropTable,
    DropTableParams, ForeignKeyDef, RenameTable, RenameTableParams, Sql, SqlParams,
};
use crate::error::Error;
use crate::parser::DocumentFormat;
use crate::snapshot::{write_atomic, ColumnInfo, IndexInfo, SchemaSnapshot, TableSchema};
use crate::sql::{quote_ident, quote_list};
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Prefix of the temporary table used while rebuilding a table.
pub const REBUILD_PREFIX: &str = "quillbase_rebuild_";

/// A schema object that differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "object", rename_all = "camelCase")]
pub enum SchemaObject {
    Table { table: String },
    Column { table: String, column: String },
    Index { table: String, index: String },
    PrimaryKey { table: String },
    ForeignKey { table: String, columns: Vec<String> },
}

impl fmt::Display for SchemaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table { table } => write!(f, "table {}", table),
            Self::Column { table, column } => write!(f, "column {}.{}", table, column),
            Self::Index { table, index } => write!(f, "index {} on {}", index, table),
            Self::PrimaryKey { table } => write!(f, "primary key of {}", table),
            Self::ForeignKey { table, columns } => {
                write!(f, "foreign key {}({})", table, columns.join(", "))
            }
        }
    }
}

/// Objects only in the live schema (`added`), only in the baseline (`removed`), or in both
/// with different definitions (`changed`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffResult {
    pub added: Vec<SchemaObject>,
    pub removed: Vec<SchemaObject>,
    pub changed: Vec<SchemaObject>,
    #[serde(skip)]
    pub live: SchemaSnapshot,
    #[serde(skip)]
    pub baseline: SchemaSnapshot,
}

/// Compare a live snapshot against a baseline.
pub fn compare(live: &SchemaSnapshot, baseline: &SchemaSnapshot) -> DiffResult {
    let mut result = DiffResult {
        added: Vec::new(),
        removed: Vec::new(),
        changed: Vec::new(),
        live: live.clone(),
        baseline: baseline.clone(),
    };

    for (name, table) in &live.tables {
        match baseline.tables.get(name) {
            None => result.added.push(SchemaObject::Table {
                table: name.clone(),
            }),
            Some(old) => result.compare_table(name, table, old),
        }
    }
    for name in baseline.tables.keys() {
        if !live.tables.contains_key(name) {
            result.removed.push(SchemaObject::Table {
                table: name.clone(),
            });
        }
    }
    result
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    fn compare_table(&mut self, name: &str, live: &TableSchema, baseline: &TableSchema) {
        let column = |column: &str| SchemaObject::Column {
            table: name.to_string(),
            column: column.to_string(),
        };
        let index = |index: &str| SchemaObject::Index {
            table: name.to_string(),
            index: index.to_string(),
        };
        let foreign_key = |columns: &[String]| SchemaObject::ForeignKey {
            table: name.to_string(),
            columns: columns.to_vec(),
        };

        for c in &live.columns {
            match baseline.column(&c.name) {
                None => self.added.push(column(&c.name)),
                Some(old) if old != c => self.changed.push(column(&c.name)),
                Some(_) => {}
            }
        }
        for c in &baseline.columns {
            if live.column(&c.name).is_none() {
                self.removed.push(column(&c.name));
            }
        }
        let same_column_set = live.columns.len() == baseline.columns.len()
            && live.columns.iter().all(|c| baseline.column(&c.name).is_some());
        if same_column_set && live.columns != baseline.columns {
            let reordered = live
                .columns
                .iter()
                .zip(&baseline.columns)
                .any(|(a, b)| a.name != b.name);
            if reordered {
                self.changed.push(SchemaObject::Table {
                    table: name.to_string(),
                });
            }
        }

        if live.primary_key != baseline.primary_key {
            self.changed.push(SchemaObject::PrimaryKey {
                table: name.to_string(),
            });
        }

        for i in &live.indexes {
            match baseline.index(&i.name) {
                None => self.added.push(index(&i.name)),
                Some(old) if old != i => self.changed.push(index(&i.name)),
                Some(_) => {}
            }
        }
        for i in &baseline.indexes {
            if live.index(&i.name).is_none() {
                self.removed.push(index(&i.name));
            }
        }

        for fk in &live.foreign_keys {
            if !baseline.foreign_keys.contains(fk) {
                self.added.push(foreign_key(&fk.columns));
            }
        }
        for fk in &baseline.foreign_keys {
            if !live.foreign_keys.contains(fk) {
                self.removed.push(foreign_key(&fk.columns));
            }
        }
    }

    /// Change sets that turn the baseline into the live schema, with ids `<prefix>-<n>`.
    pub fn to_change_log(&self, author: &str, prefix: &str) -> Result<GeneratedChangeLog, Error> {
        let mut steps: Vec<(String, Vec<Change>, Option<Vec<Change>>)> = Vec::new();

        for (name, table) in &self.live.tables {
            if self.baseline.tables.contains_key(name) {
                continue;
            }
            let mut changes = vec![create_table(name, table)?];
            for index in &table.indexes {
                changes.push(create_index(name, index)?);
            }
            // createTable and createIndex invert automatically
            steps.push((format!("create table {}", name), changes, None));
        }

        for (name, live) in &self.live.tables {
            let Some(baseline) = self.baseline.tables.get(name) else {
                continue;
            };
            if live == baseline {
                continue;
            }
            match alter_in_place(name, live, baseline)? {
                Some((changes, rollback)) => {
                    steps.push((format!("alter table {}", name), changes, rollback))
                }
                None => steps.push((
                    format!("rebuild table {}", name),
                    rebuild(name, live, baseline)?,
                    Some(rebuild(name, baseline, live)?),
                )),
            }
        }

        for (name, table) in &self.baseline.tables {
            if self.live.tables.contains_key(name) {
                continue;
            }
            let drop = Change::of::<DropTable>(&DropTableParams {
                table_name: name.clone(),
                if_exists: false,
            })?;
            let mut restore = vec![create_table(name, table)?];
            for index in &table.indexes {
                restore.push(create_index(name, index)?);
            }
            steps.push((format!("drop table {}", name), vec![drop], Some(restore)));
        }

        Ok(GeneratedChangeLog {
            change_sets: steps
                .into_iter()
                .enumerate()
                .map(|(n, (comment, changes, rollback))| GeneratedChangeSet {
                    id: format!("{}-{}", prefix, n + 1),
                    author: author.to_string(),
                    comment: Some(comment),
                    changes,
                    rollback,
                })
                .collect(),
        })
    }

    /// Render the change log and write it to `path`, atomically replacing any existing file.
    /// `.json` paths get JSON, anything else YAML.
    pub fn write_change_log(&self, path: impl AsRef<Path>, author: &str, prefix: &str) -> Result<GeneratedChangeLog, Error> {
        let path = path.as_ref();
        let change_log = self.to_change_log(author, prefix)?;
        write_atomic(path, &change_log.render(DocumentFormat::from_path(path))?)?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            path = %path.display(),
            change_sets = change_log.change_sets.len(),
            "Wrote diff change log"
        );

        Ok(change_log)
    }
}

/// A change set produced by [DiffResult::to_change_log].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedChangeSet {
    pub id: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub changes: Vec<Change>,
    /// `None` when the changes invert automatically.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Vec<Change>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedChangeLog {
    pub change_sets: Vec<GeneratedChangeSet>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Document<'a> {
    database_change_log: Vec<Entry<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Entry<'a> {
    change_set: &'a GeneratedChangeSet,
}

impl GeneratedChangeLog {
    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }

    /// Render as a change-log document the parser accepts.
    pub fn render(&self, format: DocumentFormat) -> Result<String, Error> {
        let document = Document {
            database_change_log: self
                .change_sets
                .iter()
                .map(|change_set| Entry { change_set })
                .collect(),
        };
        match format {
            DocumentFormat::Yaml => Ok(serde_yaml::to_string(&document)?),
            DocumentFormat::Json => Ok(serde_json::to_string_pretty(&document)?),
        }
    }
}

fn column_def(column: &ColumnInfo) -> ColumnDef {
    ColumnDef {
        name: column.name.clone(),
        data_type: column.type_name.clone(),
        nullable: !column.not_null,
        unique: column.unique,
        primary_key: false,
        default_value: column.default_value.clone(),
    }
}

fn create_table(name: &str, table: &TableSchema) -> Result<Change, Error> {
    let mut columns: Vec<ColumnDef> = table.columns.iter().map(column_def).collect();
    let mut primary_key = table.primary_key.clone();
    if let [single] = table.primary_key.as_slice() {
        if let Some(column) = columns.iter_mut().find(|c| &c.name == single) {
            column.primary_key = true;
            primary_key.clear();
        }
    }
    Change::of::<CreateTable>(&CreateTableParams {
        table_name: name.to_string(),
        columns,
        primary_key,
        foreign_keys: table
            .foreign_keys
            .iter()
            .map(|fk| ForeignKeyDef {
                columns: fk.columns.clone(),
                referenced_table: fk.referenced_table.clone(),
                referenced_columns: fk.referenced_columns.clone(),
            })
            .collect(),
    })
}

fn create_index(table: &str, index: &IndexInfo) -> Result<Change, Error> {
    Change::of::<CreateIndex>(&CreateIndexParams {
        index_name: index.name.clone(),
        table_name: table.to_string(),
        columns: index.columns.clone(),
        unique: index.unique,
    })
}

fn drop_index(index: &IndexInfo) -> Result<Change, Error> {
    Change::of::<DropIndex>(&DropIndexParams {
        index_name: index.name.clone(),
    })
}

fn add_columns(table: &str, columns: &[&ColumnInfo]) -> Result<Change, Error> {
    Change::of::<AddColumn>(&AddColumnParams {
        table_name: table.to_string(),
        columns: columns.iter().map(|c| column_def(c)).collect(),
    })
}

fn drop_column(table: &str, column: &ColumnInfo) -> Result<Change, Error> {
    Change::of::<DropColumn>(&DropColumnParams {
        table_name: table.to_string(),
        column_name: column.name.clone(),
    })
}

/// `ALTER TABLE ADD COLUMN` cannot add constraints that need a table scan, nor a default that
/// is not constant (`CURRENT_TIMESTAMP` and friends, or a parenthesized expression).
fn addable(column: &ColumnInfo) -> bool {
    let constant_default = column.default_value.as_deref().map_or(true, |default| {
        let default = default.trim_start();
        !default.starts_with('(') && !default.to_ascii_uppercase().starts_with("CURRENT_")
    });
    constant_default && !column.unique && !(column.not_null && column.default_value.is_none())
}

type Alteration = (Vec<Change>, Option<Vec<Change>>);

/// Changes (and their rollback) altering `baseline` into `live` without a rebuild, or `None`
/// when SQLite cannot express the difference with `ALTER TABLE`.
fn alter_in_place(name: &str, live: &TableSchema, baseline: &TableSchema) -> Result<Option<Alteration>, Error> {
    if live.primary_key != baseline.primary_key || live.foreign_keys != baseline.foreign_keys {
        return Ok(None);
    }
    let changed_column = live
        .columns
        .iter()
        .any(|c| baseline.column(&c.name).is_some_and(|old| old != c));
    if changed_column {
        return Ok(None);
    }

    let removed: Vec<&ColumnInfo> = baseline
        .columns
        .iter()
        .filter(|c| live.column(&c.name).is_none())
        .collect();
    let added: Vec<&ColumnInfo> = live
        .columns
        .iter()
        .filter(|c| baseline.column(&c.name).is_none())
        .collect();

    // added columns can only be appended
    let expected_order: Vec<&str> = baseline
        .columns
        .iter()
        .filter(|c| live.column(&c.name).is_some())
        .chain(added.iter().copied())
        .map(|c| c.name.as_str())
        .collect();
    let live_order: Vec<&str> = live.columns.iter().map(|c| c.name.as_str()).collect();
    // removed columns must be addable again for the rollback
    if expected_order != live_order || !added.iter().chain(&removed).all(|c| addable(c)) {
        return Ok(None);
    }

    let dropped_indexes: Vec<&IndexInfo> = baseline
        .indexes
        .iter()
        .filter(|i| live.index(&i.name) != Some(*i))
        .collect();
    let created_indexes: Vec<&IndexInfo> = live
        .indexes
        .iter()
        .filter(|i| baseline.index(&i.name) != Some(*i))
        .collect();
    let blocks_drop = |column: &ColumnInfo| {
        column.unique
            || baseline
                .indexes
                .iter()
                .filter(|i| !dropped_indexes.contains(i))
                .any(|i| i.columns.contains(&column.name))
    };
    if removed.iter().any(|c| blocks_drop(*c)) {
        return Ok(None);
    }

    let mut changes: Vec<Change> = dropped_indexes.iter().map(|i| drop_index(i)).collect::<Result<_, _>>()?;
    for column in &removed {
        changes.push(drop_column(name, column)?);
    }
    if !added.is_empty() {
        changes.push(add_columns(name, &added)?);
    }
    for index in &created_indexes {
        changes.push(create_index(name, index)?);
    }

    let mut rollback: Vec<Change> = created_indexes.iter().rev().map(|i| drop_index(i)).collect::<Result<_, _>>()?;
    for column in added.iter().rev() {
        rollback.push(drop_column(name, column)?);
    }
    if !removed.is_empty() {
        rollback.push(add_columns(name, &removed)?);
    }
    for index in &dropped_indexes {
        rollback.push(create_index(name, index)?);
    }

    Ok(Some((changes, Some(rollback))))
}

/// Rebuild `name` from its `from` definition into `to`, keeping the data of common columns.
fn rebuild(name: &str, to: &TableSchema, from: &TableSchema) -> Result<Vec<Change>, Error> {
    let temporary = format!("{}{}", REBUILD_PREFIX, name);
    let common: Vec<String> = to
        .columns
        .iter()
        .filter(|c| from.column(&c.name).is_some())
        .map(|c| c.name.clone())
        .collect();

    let mut changes = vec![create_table(&temporary, to)?];
    if !common.is_empty() {
        let columns = quote_list(&common);
        changes.push(Change::of::<Sql>(&SqlParams {
            sql: format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                quote_ident(&temporary),
                columns,
                columns,
                quote_ident(name)
            ),
        })?);
    }
    changes.push(Change::of::<DropTable>(&DropTableParams {
        table_name: name.to_string(),
        if_exists: false,
    })?);
    changes.push(Change::of::<RenameTable>(&RenameTableParams {
        old_table_name: temporary,
        new_table_name: name.to_string(),
    })?);
    for index in &to.indexes {
        changes.push(create_index(name, index)?);
    }
    Ok(changes)
}
