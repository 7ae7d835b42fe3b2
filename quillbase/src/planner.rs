//! Planning: which change sets to apply, or which records to reverse, given the tracker state.
//!
//! Planning is pure. It reads a [ChangeLog] and a [TrackerState] and never touches the
//! database, so a plan can be previewed without side effects. Updates follow document order
//! and rollbacks follow reverse execution order; there is no dependency-based reordering.

use crate::change::{Change, ChangeRegistry};
use crate::changelog::{ChangeLog, ChangeSet};
use crate::error::Error;
use crate::tracker::{ExecType, ExecutionRecord, TrackerState};

/// Why a change set is part of an update plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    /// Never applied, or its latest record is `FAILED` or `ROLLED_BACK`.
    Execute,
    /// A `runOnChange` change set whose checksum changed since it was applied.
    Rerun,
}

impl PlannedAction {
    pub fn exec_type(&self) -> ExecType {
        match self {
            Self::Execute => ExecType::Executed,
            Self::Rerun => ExecType::Reran,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChangeSet<'a> {
    pub change_set: &'a ChangeSet,
    pub action: PlannedAction,
}

/// A record to reverse, paired with the changes that reverse it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRollback<'a> {
    pub record: ExecutionRecord,
    pub change_set: &'a ChangeSet,
    pub changes: Vec<Change>,
    /// The change set was only marked as ran, so there is nothing to undo in the schema;
    /// reversing it only appends the marker.
    pub mark_only: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationPlanner<'a> {
    change_log: &'a ChangeLog,
    registry: &'a ChangeRegistry,
    accept_drift: bool,
}

impl<'a> MigrationPlanner<'a> {
    pub fn new(change_log: &'a ChangeLog, registry: &'a ChangeRegistry) -> Self {
        Self {
            change_log,
            registry,
            accept_drift: false,
        }
    }

    /// Accept every checksum mismatch instead of failing validation.
    pub fn accept_drift(mut self, accept: bool) -> Self {
        self.accept_drift = accept;
        self
    }

    /// Check every applied change set's recorded checksum against the change log.
    ///
    /// A mismatch is tolerated when the change set is `runOnChange` (the update plan reruns it),
    /// when `validCheckSum` lists either checksum or `ANY`, or when drift is accepted.
    /// Records without a change set in the document are ignored here; rolling them back fails.
    pub fn validate(&self, state: &TrackerState) -> Result<(), Error> {
        for record in &state.executed {
            let Some(change_set) = self.change_log.find(&record.key) else {
                #[cfg(feature = "tracing")]
                tracing::warn!(change_set = %record.key, "Executed change set is not in the change log");
                continue;
            };
            if record.checksum == change_set.checksum
                || change_set.run_on_change
                || change_set.accepts_checksum(&record.checksum)
                || change_set.accepts_checksum(&change_set.checksum)
            {
                continue;
            }
            if self.accept_drift {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    change_set = %record.key,
                    recorded = %record.checksum,
                    current = %change_set.checksum,
                    "Accepting checksum drift"
                );
                continue;
            }
            return Err(Error::ChecksumMismatch {
                key: record.key.clone(),
                recorded: record.checksum.clone(),
                current: change_set.checksum.clone(),
            });
        }
        Ok(())
    }

    /// Change sets still to apply, in document order, at most `limit` of them.
    pub fn plan_update(&self, state: &TrackerState, limit: Option<usize>) -> Vec<PlannedChangeSet<'a>> {
        self.change_log
            .iter()
            .filter_map(|change_set| {
                let action = match state.latest.get(&change_set.key) {
                    None => PlannedAction::Execute,
                    Some(record) if !record.exec_type.is_effective() => PlannedAction::Execute,
                    Some(record)
                        if change_set.run_on_change && record.checksum != change_set.checksum =>
                    {
                        PlannedAction::Rerun
                    }
                    Some(_) => return None,
                };
                Some(PlannedChangeSet { change_set, action })
            })
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// The latest `count` applied change sets, newest first, with their reverse changes.
    pub fn plan_rollback(&self, state: &TrackerState, count: usize) -> Result<Vec<PlannedRollback<'a>>, Error> {
        state
            .executed
            .iter()
            .rev()
            .take(count)
            .map(|record| self.plan_reversal(record))
            .collect()
    }

    /// Every change set applied after the latest applied change set tagged `tag`, newest first.
    pub fn plan_rollback_to_tag(&self, state: &TrackerState, tag: &str) -> Result<Vec<PlannedRollback<'a>>, Error> {
        let position = state
            .executed
            .iter()
            .rposition(|record| record.tag.as_deref() == Some(tag))
            .ok_or_else(|| Error::TagNotFound(tag.to_string()))?;
        self.plan_rollback(state, state.executed.len() - position - 1)
    }

    fn plan_reversal(&self, record: &ExecutionRecord) -> Result<PlannedRollback<'a>, Error> {
        let change_set = self
            .change_log
            .find(&record.key)
            .ok_or_else(|| Error::UnknownChangeSet {
                key: record.key.clone(),
            })?;

        if record.exec_type == ExecType::MarkRan {
            return Ok(PlannedRollback {
                record: record.clone(),
                change_set,
                changes: Vec::new(),
                mark_only: true,
            });
        }

        let changes = match &change_set.rollback {
            Some(explicit) => explicit.clone(),
            None => self
                .registry
                .invert_all(&change_set.changes)
                .map_err(Error::Generic)?
                .ok_or_else(|| Error::MissingRollbackDefinition {
                    key: change_set.key.clone(),
                })?,
        };
        Ok(PlannedRollback {
            record: record.clone(),
            change_set,
            changes,
            mark_only: false,
        })
    }
}
