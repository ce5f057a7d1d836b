//! 实体记录模型
//!
//! - `EntityId`: 实体主键（整数或字符串）
//! - `Record`: 缓存中的一条实体（普通字段 + 已归一化的关系引用）
//! - `EntityRef`: 指向缓存槽位的共享句柄
//!
//! 同一主键在缓存中只有一个槽位，后续合并都在槽位上原地进行，
//! 因此任何先前取得的 `EntityRef` 都能观察到之后的更新。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// 后端返回的原始行（字段名 → 值）
pub type Row = Map<String, Value>;

/// 占位 ID 的进程内序号
static PLACEHOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// 实体主键
///
/// 后端主键可能是整数也可能是字符串（UUID 等）。
/// 相等与哈希按字符串形式比较：`EntityId::Int(42)` 与 `EntityId::Text("42")` 是同一个键，
/// 与后端按列类型解析过滤值的行为一致。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Text(String),
}

impl EntityId {
    /// 从 JSON 值解析主键，空字符串、null 与非整数数字都视为无效
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(EntityId::Int),
            Value::String(s) if !s.is_empty() => Some(EntityId::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            EntityId::Int(n) => Value::from(*n),
            EntityId::Text(s) => Value::from(s.as_str()),
        }
    }

    /// 存储键（主键的字符串形式）
    pub fn key(&self) -> Cow<'_, str> {
        match self {
            EntityId::Int(n) => Cow::Owned(n.to_string()),
            EntityId::Text(s) => Cow::Borrowed(s),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EntityId::Text(s) => Some(s),
            EntityId::Int(_) => None,
        }
    }

    /// 生成客户端占位 ID（如 `_new1697430000000-3`）
    ///
    /// 用于乐观 UI 的新建流程：在后端分配真实 ID 之前先给实体一个本地标识，
    /// `save` 时会识别该前缀并走插入分支。
    pub fn placeholder(prefix: &str) -> Self {
        let seq = PLACEHOLDER_SEQ.fetch_add(1, Ordering::Relaxed);
        EntityId::Text(format!(
            "{prefix}{}-{seq}",
            chrono::Utc::now().timestamp_millis()
        ))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(n) => write!(f, "{n}"),
            EntityId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl PartialEq for EntityId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EntityId::Int(a), EntityId::Int(b)) => a == b,
            _ => self.key() == other.key(),
        }
    }
}

impl Eq for EntityId {}

impl Hash for EntityId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Int(value)
    }
}

impl From<i32> for EntityId {
    fn from(value: i32) -> Self {
        EntityId::Int(i64::from(value))
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Text(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId::Text(value)
    }
}

/// 已归一化的关系值
#[derive(Debug, Clone)]
pub enum Related {
    /// 单个关联实体（多对一）
    One(EntityRef),
    /// 关联实体列表（一对多）
    Many(Vec<EntityRef>),
}

impl Related {
    /// 以列表形式返回所有关联实体
    pub fn refs(&self) -> Vec<EntityRef> {
        match self {
            Related::One(entity) => vec![entity.clone()],
            Related::Many(entities) => entities.clone(),
        }
    }
}

/// 缓存中的实体
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: Row,
    relations: BTreeMap<String, Related>,
}

impl Record {
    pub fn new(fields: Row) -> Self {
        Self {
            fields,
            relations: BTreeMap::new(),
        }
    }

    pub fn fields(&self) -> &Row {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn related(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    pub fn relations(&self) -> &BTreeMap<String, Related> {
        &self.relations
    }

    /// 逐字段合并：传入字段覆盖同名字段，未出现的字段保持不变
    pub fn merge_fields(&mut self, incoming: Row) {
        for (key, value) in incoming {
            self.fields.insert(key, value);
        }
    }

    pub fn set_related(&mut self, name: impl Into<String>, related: Related) {
        self.relations.insert(name.into(), related);
    }
}

/// 指向缓存槽位的共享句柄
///
/// 克隆只复制指针；读取时拿到的是槽位的最新状态。
#[derive(Clone)]
pub struct EntityRef {
    id: EntityId,
    slot: Arc<RwLock<Record>>,
}

impl EntityRef {
    pub(crate) fn new(id: EntityId, record: Record) -> Self {
        Self {
            id,
            slot: Arc::new(RwLock::new(record)),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// 获取槽位的读锁
    ///
    /// 锁中毒时直接取回内部数据：合并只做字段插入，不存在半写状态。
    pub fn read(&self) -> RwLockReadGuard<'_, Record> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Record> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.read().get(field).cloned()
    }

    pub fn related(&self, name: &str) -> Option<Related> {
        self.read().related(name).cloned()
    }

    /// 单值关系；关系不存在或为列表时返回 `None`
    pub fn related_one(&self, name: &str) -> Option<EntityRef> {
        match self.related(name)? {
            Related::One(entity) => Some(entity),
            Related::Many(_) => None,
        }
    }

    /// 列表关系；单值关系会被包装成单元素列表
    pub fn related_many(&self, name: &str) -> Vec<EntityRef> {
        self.related(name).map(|r| r.refs()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Record {
        self.read().clone()
    }

    /// 两个句柄是否指向同一个缓存槽位
    pub fn same_entity(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// 渲染为 JSON：普通字段 + 每个关系展开一层（只包含关联实体的普通字段）
    ///
    /// 关系图可能有环，因此不做递归展开。
    pub fn to_json(&self) -> Value {
        let (mut out, relations) = {
            let record = self.read();
            (record.fields().clone(), record.relations().clone())
        };

        for (name, related) in relations {
            let value = match related {
                Related::One(entity) => Value::Object(entity.read().fields().clone()),
                Related::Many(entities) => Value::Array(
                    entities
                        .iter()
                        .map(|e| Value::Object(e.read().fields().clone()))
                        .collect(),
                ),
            };
            out.insert(name, value);
        }

        Value::Object(out)
    }

    /// 反序列化为业务类型（基于 `to_json` 的结果）
    pub fn deserialize<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.to_json())
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef").field("id", &self.id).finish()
    }
}
