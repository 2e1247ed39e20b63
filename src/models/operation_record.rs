//! OperationRecord entity model
//!
//! One row per scaling-affecting action. Rows are written `processing` when
//! an asynchronous job is submitted and moved to a terminal status by the
//! reconciliation pass; actions without a backing job are written terminal.

use std::fmt;
use std::str::FromStr;

use sea_orm::{ActiveModelBehavior, Iterable};
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};

/// Kind of action captured by a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "camelCase")]
pub enum RecordType {
    #[sea_orm(string_value = "addNodes")]
    AddNodes,
    #[sea_orm(string_value = "addEssNodes")]
    AddEssNodes,
    #[sea_orm(string_value = "rmNodes")]
    RmNodes,
    #[sea_orm(string_value = "deleteNodes")]
    DeleteNodes,
    #[sea_orm(string_value = "deleteEssNodes")]
    DeleteEssNodes,
    #[sea_orm(string_value = "deleteEssNodesCron")]
    DeleteEssNodesCron,
    #[sea_orm(string_value = "setLabels")]
    SetLabels,
    #[sea_orm(string_value = "unsetLabels")]
    UnsetLabels,
    #[sea_orm(string_value = "resetCredential")]
    ResetCredential,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::AddNodes => "addNodes",
            RecordType::AddEssNodes => "addEssNodes",
            RecordType::RmNodes => "rmNodes",
            RecordType::DeleteNodes => "deleteNodes",
            RecordType::DeleteEssNodes => "deleteEssNodes",
            RecordType::DeleteEssNodesCron => "deleteEssNodesCron",
            RecordType::SetLabels => "setLabels",
            RecordType::UnsetLabels => "unsetLabels",
            RecordType::ResetCredential => "resetCredential",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RecordType::iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown record type '{value}'"))
    }
}

/// Lifecycle status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "camelCase")]
pub enum RecordStatus {
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "success")]
    Success,
    /// Legacy spelling of `Success` still present in older rows
    #[sea_orm(string_value = "successed")]
    Successed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "unknown")]
    Unknown,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Processing => "processing",
            RecordStatus::Success => "success",
            RecordStatus::Successed => "successed",
            RecordStatus::Failed => "failed",
            RecordStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::Processing)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RecordStatus::Success | RecordStatus::Successed)
    }

    /// Whether a record in this status may be moved to `next` by normal
    /// processing. Re-writing the current status is a no-op and allowed.
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        *self == next || (*self == RecordStatus::Processing && next.is_terminal())
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RecordStatus::iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown record status '{value}'"))
    }
}

/// OperationRecord entity
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "operation_records")]
pub struct Model {
    /// Auto-increment identifier (primary key)
    #[sea_orm(primary_key)]
    pub id: i64,

    pub record_type: RecordType,

    /// Actor that submitted the action; the autoscaler uses a fixed system user
    pub user_id: String,

    pub org_id: i64,

    pub cluster_name: String,

    pub status: RecordStatus,

    /// Host/instance detail as JSON, or error text once the record failed
    #[sea_orm(column_type = "Text")]
    pub detail: String,

    /// Identifier of the externally-run job, 0 when there is none
    pub pipeline_id: i64,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse the host/instance detail persisted with add/delete ESS records.
    pub fn nodes_detail(&self) -> Result<NodesRecordDetail, serde_json::Error> {
        serde_json::from_str(&self.detail)
    }
}

/// Hosts and cloud instance ids touched by a node add/delete action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodesRecordDetail {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub instance_ids: Vec<String>,
    /// First failing task message, filled in by reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodesRecordDetail {
    /// Instance ids sorted and deduplicated, for set comparison.
    pub fn instance_set(&self) -> Vec<String> {
        let mut ids = self.instance_ids.clone();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Attach a failure message to a persisted detail. JSON object details keep
/// their content and gain an `error` field; anything else is replaced.
pub fn detail_with_error(detail: &str, message: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(detail) {
        Ok(serde_json::Value::Object(mut map)) => {
            map.insert(
                "error".to_string(),
                serde_json::Value::String(message.to_string()),
            );
            serde_json::Value::Object(map).to_string()
        }
        _ => message.to_string(),
    }
}

/// Detail persisted with a scheduled deletion record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronRecordDetail {
    pub cron_id: i64,
    pub cron_expr: String,
    pub launch_time: String,
    pub scaling_group_id: String,
}
