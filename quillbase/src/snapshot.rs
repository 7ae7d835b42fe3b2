//! Captured SQLite schema, used as a diff input and as a baseline file.

use crate::error::Error;
use crate::parser::DocumentFormat;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Represents a captured database schema for comparison and snapshotting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Map of table name to table definitions
    pub tables: BTreeMap<String, TableSchema>,
}

/// Represents a table's schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Columns in declaration order
    pub columns: Vec<ColumnInfo>,
    /// Primary key columns in key order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
    /// Explicitly created indexes, sorted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyInfo>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// Information about a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type, upper-cased. Empty for untyped columns.
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub not_null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Single-column `UNIQUE` constraint.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
}

/// Information about an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyInfo {
    pub columns: Vec<String>,
    pub referenced_table: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_columns: Vec<String>,
}

impl SchemaSnapshot {
    /// Capture the current schema, leaving out SQLite's internal tables and `excluded_tables`.
    pub fn capture(conn: &Connection, excluded_tables: &[&str]) -> Result<Self, Error> {
        let table_names: Vec<String> = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = BTreeMap::new();
        for table_name in table_names {
            if excluded_tables.contains(&table_name.as_str()) {
                continue;
            }
            let table = capture_table(conn, &table_name)?;
            tables.insert(table_name, table);
        }
        Ok(Self { tables })
    }

    /// Read a baseline file. `.json` files are JSON, anything else YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match DocumentFormat::from_path(path) {
            DocumentFormat::Json => Ok(serde_json::from_str(&contents)?),
            DocumentFormat::Yaml => Ok(serde_yaml::from_str(&contents)?),
        }
    }

    /// Write the snapshot as a baseline file, replacing any existing file atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let contents = match DocumentFormat::from_path(path) {
            DocumentFormat::Json => serde_json::to_string_pretty(self)?,
            DocumentFormat::Yaml => serde_yaml::to_string(self)?,
        };
        write_atomic(path, &contents)
    }
}

fn capture_table(conn: &Connection, table_name: &str) -> Result<TableSchema, Error> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let rows: Vec<(ColumnInfo, i64)> = stmt
        .query_map([table_name], |row| {
            Ok((
                ColumnInfo {
                    name: row.get(0)?,
                    type_name: row.get::<_, String>(1)?.to_uppercase(),
                    not_null: row.get::<_, i64>(2)? != 0,
                    default_value: row.get(3)?,
                    unique: false,
                },
                row.get(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut key: Vec<(i64, String)> = rows
        .iter()
        .filter(|(_, position)| *position > 0)
        .map(|(column, position)| (*position, column.name.clone()))
        .collect();
    key.sort();
    let primary_key = key.into_iter().map(|(_, name)| name).collect();
    let mut columns: Vec<ColumnInfo> = rows.into_iter().map(|(column, _)| column).collect();

    let mut indexes = Vec::new();
    let index_list: Vec<(String, bool, String)> = conn
        .prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1)")?
        .query_map([table_name], |row| {
            Ok((row.get(0)?, row.get::<_, i64>(1)? != 0, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (name, unique, origin) in index_list {
        let index_columns = index_columns(conn, &name)?;
        match origin.as_str() {
            "c" => indexes.push(IndexInfo {
                name,
                columns: index_columns,
                unique,
            }),
            // inline UNIQUE constraint
            "u" if index_columns.len() == 1 => {
                if let Some(column) = columns.iter_mut().find(|c| c.name == index_columns[0]) {
                    column.unique = true;
                }
            }
            // primary key and multi-column constraint indexes are implied by the table definition
            _ => {}
        }
    }
    indexes.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(TableSchema {
        columns,
        primary_key,
        indexes,
        foreign_keys: foreign_keys(conn, table_name)?,
    })
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>, Error> {
    let columns = conn
        .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?
        .query_map([index_name], |row| row.get::<_, Option<String>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    // expression index entries have no column name
    Ok(columns.into_iter().flatten().collect())
}

fn foreign_keys(conn: &Connection, table_name: &str) -> Result<Vec<ForeignKeyInfo>, Error> {
    let rows: Vec<(i64, String, String, Option<String>)> = conn
        .prepare(
            "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
        )?
        .query_map([table_name], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grouped: BTreeMap<i64, ForeignKeyInfo> = BTreeMap::new();
    for (id, referenced_table, from, to) in rows {
        let fk = grouped.entry(id).or_insert_with(|| ForeignKeyInfo {
            columns: Vec::new(),
            referenced_table,
            referenced_columns: Vec::new(),
        });
        fk.columns.push(from);
        fk.referenced_columns.extend(to);
    }
    let mut foreign_keys: Vec<ForeignKeyInfo> = grouped.into_values().collect();
    foreign_keys.sort();
    Ok(foreign_keys)
}

/// Write `contents` to a temporary file next to `path`, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), Error> {
    let io_error = |source: std::io::Error| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
    file.write_all(contents.as_bytes()).map_err(io_error)?;
    file.as_file().sync_all().map_err(io_error)?;
    file.persist(path).map_err(|e| io_error(e.error))?;
    Ok(())
}
