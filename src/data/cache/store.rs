//! 主键 → 实体的存储槽位
//!
//! 提供：
//! - 每个主键至多一个槽位，已存在的槽位原地逐字段合并
//! - 可选的版本守卫：更旧的行不会覆盖更新的记录
//! - 变更广播：`Upserted` / `Removed` 事件，供响应式消费者监听
//!
//! 读写锁只在同步代码段中持有，不会跨越 `.await`。

use crate::models::{EntityId, EntityRef, Record, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

/// 存储变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// 记录被新建或合并
    Upserted { id: EntityId },
    /// 记录被移除
    Removed { id: EntityId },
}

/// `upsert` 的结果
#[derive(Debug, Clone)]
pub enum Upsert {
    /// 已新建或合并
    Applied(EntityRef),
    /// 传入行版本更旧，现有记录保持不变
    Stale(EntityRef),
}

impl Upsert {
    pub fn entity(&self) -> &EntityRef {
        match self {
            Upsert::Applied(entity) | Upsert::Stale(entity) => entity,
        }
    }

    pub fn into_entity(self) -> EntityRef {
        match self {
            Upsert::Applied(entity) | Upsert::Stale(entity) => entity,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Upsert::Stale(_))
    }
}

/// 单表的实体存储
#[derive(Debug)]
pub struct KeyedStore {
    entries: RwLock<HashMap<EntityId, EntityRef>>,
    events: broadcast::Sender<StoreEvent>,
    /// 版本字段（为空时后写覆盖先写）
    version_field: Option<String>,
}

impl KeyedStore {
    /// 创建存储
    ///
    /// # 参数
    ///
    /// - `event_buffer`: 变更广播的容量，消费过慢的订阅者会收到 `Lagged`
    /// - `version_field`: 版本守卫字段
    pub fn new(event_buffer: usize, version_field: Option<String>) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
            version_field,
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<EntityRef> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// 当前所有记录（顺序不保证）
    pub fn all(&self) -> Vec<EntityRef> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 合并或插入一条记录
    ///
    /// 已存在时在原槽位上逐字段合并（保持引用稳定），否则新建槽位。
    /// 启用版本守卫且传入行更旧时，保留现有记录不变并返回 `Stale`。
    pub fn upsert(&self, id: EntityId, fields: Row) -> Upsert {
        let entity = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            match entries.get(&id).cloned() {
                Some(existing) => {
                    let mut record = existing.write();
                    if self.is_stale(&record, &fields) {
                        tracing::debug!(id = %id, "忽略版本更旧的行");
                        drop(record);
                        return Upsert::Stale(existing);
                    }
                    record.merge_fields(fields);
                    drop(record);
                    existing
                }
                None => {
                    let entity = EntityRef::new(id.clone(), Record::new(fields));
                    entries.insert(id.clone(), entity.clone());
                    entity
                }
            }
        };

        self.notify(StoreEvent::Upserted { id });
        Upsert::Applied(entity)
    }

    /// 传入行是否会被版本守卫拒绝（记录不存在时为 false）
    pub fn is_stale_row(&self, id: &EntityId, fields: &Row) -> bool {
        self.get(id)
            .is_some_and(|existing| self.is_stale(&existing.read(), fields))
    }

    /// 移除一条记录，返回被移除的槽位
    pub fn remove(&self, id: &EntityId) -> Option<EntityRef> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        if removed.is_some() {
            self.notify(StoreEvent::Removed { id: id.clone() });
        }
        removed
    }

    /// 批量移除，返回实际移除的数量
    pub fn remove_many(&self, ids: &[EntityId]) -> usize {
        let removed: Vec<EntityId> = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            ids.iter()
                .filter(|id| entries.remove(*id).is_some())
                .cloned()
                .collect()
        };

        let count = removed.len();
        for id in removed {
            self.notify(StoreEvent::Removed { id });
        }
        count
    }

    /// 订阅存储变更
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        if let Err(e) = self.events.send(event) {
            tracing::trace!(error = %e, "没有存储变更订阅者");
        }
    }

    /// 传入行的版本是否比现有记录更旧
    fn is_stale(&self, existing: &Record, incoming: &Row) -> bool {
        let Some(field) = self.version_field.as_deref() else {
            return false;
        };

        match (existing.get(field), incoming.get(field)) {
            (Some(Value::Number(current)), Some(Value::Number(next))) => {
                match (current.as_f64(), next.as_f64()) {
                    (Some(current), Some(next)) => next < current,
                    _ => false,
                }
            }
            // ISO-8601 时间戳按字典序即时间序
            (Some(Value::String(current)), Some(Value::String(next))) => next < current,
            _ => false,
        }
    }
}
