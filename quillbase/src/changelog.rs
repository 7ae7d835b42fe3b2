//! In-memory model of a parsed change log.

use crate::change::Change;
use crate::precondition::Preconditions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of a change set. Unique across a fully resolved change log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeSetKey {
    pub id: String,
    pub author: String,
    /// Path of the declaring document, relative to the root change log's directory, `/` separated.
    pub change_log: String,
}

impl ChangeSetKey {
    pub fn new(
        id: impl Into<String>,
        author: impl Into<String>,
        change_log: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            change_log: change_log.into(),
        }
    }
}

impl fmt::Display for ChangeSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.change_log, self.id, self.author)
    }
}

/// A uniquely keyed, ordered unit of schema change. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub key: ChangeSetKey,
    pub changes: Vec<Change>,
    /// `None` derives the rollback from the changes; `Some(vec![])` is an explicit no-op rollback.
    pub rollback: Option<Vec<Change>>,
    pub tag: Option<String>,
    pub comment: Option<String>,
    /// Re-run the change set whenever its checksum changes instead of failing validation.
    pub run_on_change: bool,
    /// When false a failure is recorded as `FAILED` and the run continues.
    pub fail_on_error: bool,
    /// Checksums accepted in place of a mismatching recorded one. `ANY` accepts every checksum.
    pub valid_checksums: Vec<String>,
    pub preconditions: Option<Preconditions>,
    pub checksum: String,
}

impl ChangeSet {
    /// Whether `checksum` is listed in `validCheckSum`, directly or through `ANY`.
    pub fn accepts_checksum(&self, checksum: &str) -> bool {
        self.valid_checksums
            .iter()
            .any(|valid| valid.eq_ignore_ascii_case("ANY") || valid.eq_ignore_ascii_case(checksum))
    }
}

/// An ordered collection of change sets with every include resolved.
///
/// The default is an empty change log, enough for operations that never plan anything
/// such as [crate::Migrator::release_locks] or [crate::Migrator::drop_all].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeLog {
    root: PathBuf,
    change_sets: Vec<ChangeSet>,
}

impl ChangeLog {
    pub(crate) fn new(root: PathBuf, change_sets: Vec<ChangeSet>) -> Self {
        Self { root, change_sets }
    }

    /// Path of the root document.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeSet> {
        self.change_sets.iter()
    }

    pub fn len(&self) -> usize {
        self.change_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }

    pub fn find(&self, key: &ChangeSetKey) -> Option<&ChangeSet> {
        self.change_sets.iter().find(|cs| &cs.key == key)
    }
}

impl<'a> IntoIterator for &'a ChangeLog {
    type Item = &'a ChangeSet;
    type IntoIter = std::slice::Iter<'a, ChangeSet>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
