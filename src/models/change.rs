// 实时变更事件模型
//
// 与 Postgres 逻辑复制推送的载荷保持一致：
// {"eventType": "INSERT" | "UPDATE" | "DELETE", "new": {...}, "old": {...}}

use super::record::{EntityId, Row};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// 单条变更事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    /// 变更后的行（DELETE 时为空）
    #[serde(default)]
    pub new: Row,
    /// 变更前的行（DELETE 时至少包含主键）
    #[serde(default)]
    pub old: Row,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, new: Row) -> Self {
        Self::build(ChangeKind::Insert, table.into(), new, Row::new())
    }

    pub fn update(table: impl Into<String>, new: Row, old: Row) -> Self {
        Self::build(ChangeKind::Update, table.into(), new, old)
    }

    pub fn delete(table: impl Into<String>, old: Row) -> Self {
        Self::build(ChangeKind::Delete, table.into(), Row::new(), old)
    }

    fn build(event_type: ChangeKind, table: String, new: Row, old: Row) -> Self {
        Self {
            event_type,
            schema: default_schema(),
            table,
            new,
            old,
            commit_timestamp: Some(Utc::now()),
        }
    }

    /// DELETE 事件中被删除行的主键
    pub fn old_id(&self, id_field: &str) -> Option<EntityId> {
        self.old.get(id_field).and_then(EntityId::from_value)
    }
}
