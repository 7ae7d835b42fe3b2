//! Change-log parsing.
//!
//! A change-log document is YAML or JSON with a single `databaseChangeLog` list. Each entry is
//! a `changeSet`, an `include` of another document or an `includeAll` of a directory:
//!
//! ```yaml
//! databaseChangeLog:
//!   - changeSet:
//!       id: create-users
//!       author: alice
//!       changes:
//!         - createTable:
//!             tableName: users
//!             columns:
//!               - { name: id, type: INTEGER, primaryKey: true }
//!   - include: { file: releases/1.1.yaml }
//!   - includeAll: { path: releases/next/ }
//! ```
//!
//! Includes resolve against the root document's directory, or against the including document
//! with `relativeToChangelogFile: true`. Change sets are returned in document order with every
//! include expanded in place. Nothing here touches a database.

use crate::change::{Change, ChangeRegistry};
use crate::changelog::{ChangeLog, ChangeSet, ChangeSetKey};
use crate::checksum;
use crate::error::{Error, ParseError};
use crate::precondition::Preconditions;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Serialization format of a change-log document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// Pick the format from a file extension. Anything other than `.json` is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }

    fn is_change_log(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
            Some("yaml" | "yml" | "json")
        )
    }
}

/// Parses change-log documents, validating every change against a [ChangeRegistry].
#[derive(Debug, Clone, Copy)]
pub struct ChangeLogParser<'r> {
    registry: &'r ChangeRegistry,
}

impl<'r> ChangeLogParser<'r> {
    pub fn new(registry: &'r ChangeRegistry) -> Self {
        Self { registry }
    }

    /// Parse the document at `path` and everything it includes.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<ChangeLog, Error> {
        let path = path.as_ref();
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = path
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| Error::Config(format!("{} is not a file", path.display())))?;
        let source = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut state = ParseState::new(base_dir);
        state.parse_document(self, &source, DocumentFormat::from_path(path), &name)?;
        Ok(ChangeLog::new(path.to_path_buf(), state.change_sets))
    }

    /// Parse a document held in memory. `name` is the document's path relative to `base_dir`;
    /// it becomes the change-log part of every key declared directly in `source`, and includes
    /// resolve against `base_dir`.
    pub fn parse_str(
        &self,
        source: &str,
        format: DocumentFormat,
        base_dir: impl AsRef<Path>,
        name: impl AsRef<Path>,
    ) -> Result<ChangeLog, Error> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let name = name.as_ref();
        let mut state = ParseState::new(base_dir.clone());
        state.parse_document(self, source, format, name)?;
        Ok(ChangeLog::new(base_dir.join(name), state.change_sets))
    }
}

struct ParseState {
    base_dir: PathBuf,
    /// Documents currently being parsed, outermost first: (identity, logical name).
    stack: Vec<(PathBuf, PathBuf)>,
    completed: HashSet<PathBuf>,
    keys: HashSet<ChangeSetKey>,
    change_sets: Vec<ChangeSet>,
}

impl ParseState {
    fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            stack: Vec::new(),
            completed: HashSet::new(),
            keys: HashSet::new(),
            change_sets: Vec::new(),
        }
    }

    fn parse_document(
        &mut self,
        parser: &ChangeLogParser<'_>,
        source: &str,
        format: DocumentFormat,
        name: &Path,
    ) -> Result<(), Error> {
        let identity = identity_of(&self.base_dir.join(name));
        if self.stack.iter().any(|(id, _)| *id == identity) {
            let mut chain: Vec<PathBuf> = self.stack.iter().map(|(_, n)| n.clone()).collect();
            chain.push(name.to_path_buf());
            return Err(Error::CyclicInclude { chain });
        }
        if self.completed.contains(&identity) {
            #[cfg(feature = "tracing")]
            tracing::debug!(change_log = %name.display(), "Skipping change log already included");
            return Ok(());
        }

        let malformed = |message: String| {
            Error::Parse(ParseError::Malformed {
                path: name.to_path_buf(),
                message,
            })
        };
        let document: Value = match format {
            DocumentFormat::Yaml => serde_yaml::from_str(source).map_err(|e| malformed(e.to_string()))?,
            DocumentFormat::Json => serde_json::from_str(source).map_err(|e| malformed(e.to_string()))?,
        };
        let entries = match document.get("databaseChangeLog") {
            Some(Value::Array(entries)) => entries.clone(),
            Some(Value::Null) => Vec::new(),
            Some(_) => return Err(malformed("databaseChangeLog must be a list".to_string())),
            None => return Err(malformed("missing databaseChangeLog".to_string())),
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(change_log = %name.display(), entries = entries.len(), "Parsing change log");

        self.stack.push((identity.clone(), name.to_path_buf()));
        let result = self.parse_entries(parser, entries, name);
        self.stack.pop();
        result?;
        self.completed.insert(identity);
        Ok(())
    }

    fn parse_entries(
        &mut self,
        parser: &ChangeLogParser<'_>,
        entries: Vec<Value>,
        name: &Path,
    ) -> Result<(), Error> {
        let malformed = |message: String| {
            Error::Parse(ParseError::Malformed {
                path: name.to_path_buf(),
                message,
            })
        };

        for (index, entry) in entries.into_iter().enumerate() {
            let (kind, body) = match entry {
                Value::Object(map) if map.len() == 1 => match map.into_iter().next() {
                    Some(pair) => pair,
                    None => continue,
                },
                _ => {
                    return Err(malformed(format!(
                        "entry {} must be a single changeSet, include or includeAll",
                        index
                    )))
                }
            };
            match kind.as_str() {
                "changeSet" => {
                    let raw: RawChangeSet = serde_json::from_value(body)
                        .map_err(|e| malformed(format!("entry {}: {}", index, e)))?;
                    let change_set = self.build_change_set(parser, raw, name)?;
                    self.change_sets.push(change_set);
                }
                "include" => {
                    let include: RawInclude = serde_json::from_value(body)
                        .map_err(|e| malformed(format!("entry {}: {}", index, e)))?;
                    let target = self.resolve(name, &include.file, include.relative_to_changelog_file);
                    self.include_file(parser, name, &include.file, &target)?;
                }
                "includeAll" => {
                    let include: RawIncludeAll = serde_json::from_value(body)
                        .map_err(|e| malformed(format!("entry {}: {}", index, e)))?;
                    let dir = self.resolve(name, &include.path, include.relative_to_changelog_file);
                    let unresolved = |source| {
                        Error::Parse(ParseError::UnresolvedInclude {
                            from: name.to_path_buf(),
                            include: include.path.clone(),
                            source,
                        })
                    };
                    let mut files = std::fs::read_dir(self.base_dir.join(&dir))
                        .map_err(unresolved)?
                        .map(|entry| entry.map(|e| e.file_name()))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(unresolved)?;
                    files.sort();
                    for file in files {
                        let target = dir.join(&file);
                        if DocumentFormat::is_change_log(&target)
                            && self.base_dir.join(&target).is_file()
                        {
                            self.include_file(parser, name, &include.path, &target)?;
                        }
                    }
                }
                other => return Err(malformed(format!("unknown entry '{}'", other))),
            }
        }
        Ok(())
    }

    /// Logical path of an include, relative to the base directory.
    fn resolve(&self, from: &Path, include: &str, relative_to_changelog_file: bool) -> PathBuf {
        let joined = if relative_to_changelog_file {
            from.parent().unwrap_or(Path::new("")).join(include)
        } else {
            PathBuf::from(include)
        };
        lexical_normalize(&joined)
    }

    fn include_file(
        &mut self,
        parser: &ChangeLogParser<'_>,
        from: &Path,
        include: &str,
        target: &Path,
    ) -> Result<(), Error> {
        let source = std::fs::read_to_string(self.base_dir.join(target)).map_err(|source| {
            Error::Parse(ParseError::UnresolvedInclude {
                from: from.to_path_buf(),
                include: include.to_string(),
                source,
            })
        })?;
        self.parse_document(parser, &source, DocumentFormat::from_path(target), target)
    }

    fn build_change_set(
        &mut self,
        parser: &ChangeLogParser<'_>,
        raw: RawChangeSet,
        name: &Path,
    ) -> Result<ChangeSet, Error> {
        let key = ChangeSetKey::new(raw.id, raw.author, logical_name(name));
        if !self.keys.insert(key.clone()) {
            return Err(ParseError::DuplicateChangeSet {
                key,
                path: name.to_path_buf(),
            }
            .into());
        }

        validate_changes(parser.registry, &key, &raw.changes)?;
        let rollback = match raw.rollback {
            Some(value) => {
                let changes = rollback_changes(value).map_err(|message| ParseError::Malformed {
                    path: name.to_path_buf(),
                    message: format!("change set {}: {}", key, message),
                })?;
                validate_changes(parser.registry, &key, &changes)?;
                Some(changes)
            }
            None => None,
        };

        Ok(ChangeSet {
            checksum: checksum::compute(&raw.changes),
            key,
            changes: raw.changes,
            rollback,
            tag: raw.tag,
            comment: raw.comment,
            run_on_change: raw.run_on_change,
            fail_on_error: raw.fail_on_error,
            valid_checksums: raw.valid_check_sum,
            preconditions: raw.preconditions,
        })
    }
}

fn validate_changes(registry: &ChangeRegistry, key: &ChangeSetKey, changes: &[Change]) -> Result<(), ParseError> {
    for (index, change) in changes.iter().enumerate() {
        let handler = registry
            .get(&change.kind)
            .ok_or_else(|| ParseError::UnknownChangeType {
                key: key.clone(),
                kind: change.kind.clone(),
            })?;
        handler
            .validate(&change.params)
            .map_err(|message| ParseError::InvalidChange {
                key: key.clone(),
                index,
                kind: change.kind.clone(),
                message,
            })?;
    }
    Ok(())
}

/// A rollback block is a list of changes, a single change, or raw SQL text.
fn rollback_changes(value: Value) -> Result<Vec<Change>, String> {
    match value {
        Value::String(sql) => Ok(vec![Change::new("sql", serde_json::json!({ "sql": sql }))]),
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => serde_json::from_value(value).map_err(|e| format!("invalid rollback: {}", e)),
        Value::Object(_) => serde_json::from_value::<Change>(value)
            .map(|change| vec![change])
            .map_err(|e| format!("invalid rollback: {}", e)),
        _ => Err("rollback must be a list of changes or SQL text".to_string()),
    }
}

fn logical_name(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve `.` and `..` without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn identity_of(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| lexical_normalize(path))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawChangeSet {
    #[serde(deserialize_with = "scalar_string")]
    id: String,
    #[serde(deserialize_with = "scalar_string")]
    author: String,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    run_on_change: bool,
    #[serde(default = "default_true")]
    fail_on_error: bool,
    #[serde(default, deserialize_with = "one_or_many")]
    valid_check_sum: Vec<String>,
    #[serde(default)]
    preconditions: Option<Preconditions>,
    #[serde(default)]
    changes: Vec<Change>,
    #[serde(default)]
    rollback: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawInclude {
    file: String,
    #[serde(default)]
    relative_to_changelog_file: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawIncludeAll {
    path: String,
    #[serde(default)]
    relative_to_changelog_file: bool,
}

fn default_true() -> bool {
    true
}

/// Accept `id: 1` or `defaultValue: true` as well as strings.
pub(crate) fn scalar_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    optional_scalar_string(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("expected a string, found null"))
}

pub(crate) fn optional_scalar_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(serde::de::Error::custom(format!("expected a string, found {}", other))),
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(serde::de::Error::custom(format!(
                    "expected a checksum string, found {}",
                    other
                ))),
            })
            .collect(),
        other => Err(serde::de::Error::custom(format!(
            "expected a checksum or a list of checksums, found {}",
            other
        ))),
    }
}
