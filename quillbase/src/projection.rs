//! Flat, read-only rows describing applied change sets, for display by a host application.

use crate::tracker::{ExecType, ExecutionRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One applied change set as a host UI shows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetRow {
    pub id: String,
    pub author: String,
    pub change_log: String,
    pub date_executed: DateTime<Utc>,
    pub exec_type: ExecType,
    pub last_checksum: String,
    pub tag: Option<String>,
}

impl From<&ExecutionRecord> for ChangeSetRow {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            id: record.key.id.clone(),
            author: record.key.author.clone(),
            change_log: record.key.change_log.clone(),
            date_executed: record.executed_at,
            exec_type: record.exec_type,
            last_checksum: record.checksum.clone(),
            tag: record.tag.clone(),
        }
    }
}

pub fn project(records: &[ExecutionRecord]) -> Vec<ChangeSetRow> {
    records.iter().map(ChangeSetRow::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeSetKey;
    use chrono::TimeZone;

    #[test]
    fn rows_flatten_records() {
        let record = ExecutionRecord {
            key: ChangeSetKey::new("1", "alice", "db/changelog.yaml"),
            checksum: "1:abc".to_string(),
            executed_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            exec_type: ExecType::MarkRan,
            tag: Some("v1".to_string()),
            description: Some("createTable users".to_string()),
            deployment_id: None,
            sequence: 7,
        };
        let rows = project(&[record]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].change_log, "db/changelog.yaml");
        assert_eq!(rows[0].last_checksum, "1:abc");

        let json = serde_json::to_value(&rows[0]).unwrap();
        assert_eq!(json["dateExecuted"], "2024-05-01T12:00:00Z");
        assert_eq!(json["execType"], "MARK_RAN");
        assert_eq!(json["tag"], "v1");
    }
}
