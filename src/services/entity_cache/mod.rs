//! Entity Cache Module
//!
//! 单表实体缓存：在内存中维护一张远端表的归一化镜像，按职责拆分为多个子模块
//!
//! - `normalize`: 嵌套载荷的归一化（`add` / `remove`）
//! - `read`: 批量加载、单条查找、自定义查询与本地读取
//! - `write`: 先写后端、再用后端返回的行回填缓存
//! - `realtime`: 变更流订阅
//!
//! 缓存之间通过 `RelationDef` 组成关系图，图中允许有环：
//! 关系目标是一个惰性工厂，直到第一次归一化嵌套载荷时才解析。

mod normalize;
mod read;
mod realtime;
mod write;

#[cfg(test)]
mod tests;

use crate::data::{CacheError, KeyedStore, LoadMarkers, Result, StoreEvent};
use crate::models::config::CacheConfig;
use crate::models::{EntityId, EntityRef};
use crate::services::backend::Backend;
use regex::Regex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use read::{FindOptions, SelectOptions};

/// 关系基数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// 嵌套载荷为单个对象（多对一）
    One,
    /// 嵌套载荷为对象数组（一对多）
    Many,
}

/// 关系目标的惰性工厂
///
/// 只在需要时调用，用于打破缓存之间的构造顺序依赖。
pub type CacheFactory = Arc<dyn Fn() -> Result<Arc<EntityCache>> + Send + Sync>;

/// 关系声明：关系名 → (目标缓存, 目标表名, 基数)
#[derive(Clone)]
pub struct RelationDef {
    name: String,
    table: String,
    cardinality: Cardinality,
    target: CacheFactory,
}

impl RelationDef {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        cardinality: Cardinality,
        target: CacheFactory,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            cardinality,
            target,
        }
    }

    /// 多对一关系（如 `posts.author` → `users`）
    pub fn one(name: impl Into<String>, table: impl Into<String>, target: CacheFactory) -> Self {
        Self::new(name, table, Cardinality::One, target)
    }

    /// 一对多关系（如 `users.posts` → `posts`）
    pub fn many(name: impl Into<String>, table: impl Into<String>, target: CacheFactory) -> Self {
        Self::new(name, table, Cardinality::Many, target)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 嵌套载荷中使用的表名
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// 解析目标缓存，并校验其表名与声明一致
    pub fn resolve(&self) -> Result<Arc<EntityCache>> {
        let cache = (self.target)()?;
        if cache.table_name() != self.table {
            return Err(CacheError::Schema(format!(
                "关系 {} 声明的表为 {}，目标缓存的表为 {}",
                self.name,
                self.table,
                cache.table_name()
            )));
        }
        Ok(cache)
    }
}

impl fmt::Debug for RelationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationDef")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("cardinality", &self.cardinality)
            .finish()
    }
}

/// 活跃的实时订阅
struct Subscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// 单表实体缓存
pub struct EntityCache {
    pub(super) table: String,
    pub(super) backend: Arc<dyn Backend>,
    pub(super) relations: Vec<RelationDef>,
    pub(super) config: CacheConfig,
    pub(super) placeholder: Regex,
    pub(super) store: KeyedStore,
    pub(super) markers: LoadMarkers,
    realtime: Mutex<Option<Subscription>>,
    subscribed: Arc<AtomicBool>,
}

impl EntityCache {
    pub fn builder(table: impl Into<String>, backend: Arc<dyn Backend>) -> EntityCacheBuilder {
        EntityCacheBuilder {
            table: table.into(),
            backend,
            relations: Vec::new(),
            config: CacheConfig::default(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn relations(&self) -> &[RelationDef] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 指向自身的工厂（只持有弱引用，不会延长缓存生命周期）
    pub fn factory(self: &Arc<Self>) -> CacheFactory {
        let weak: Weak<EntityCache> = Arc::downgrade(self);
        let table = self.table.clone();
        Arc::new(move || {
            weak.upgrade()
                .ok_or_else(|| CacheError::UnknownCache(table.clone()))
        })
    }

    /// 生成选择表达式
    ///
    /// `base` 默认为全字段，`include` 中的每个关系按调用方给定的顺序追加 `<table>(*)`：
    /// `get_key(None, &["author"])` → `*,users(*)`
    pub fn get_key<S: AsRef<str>>(&self, base: Option<&str>, include: &[S]) -> Result<String> {
        let mut parts = vec![base.unwrap_or(&self.config.select_all).to_string()];
        for name in include {
            let name = name.as_ref();
            let relation = self
                .relation(name)
                .ok_or_else(|| CacheError::UnknownRelation {
                    table: self.table.clone(),
                    relation: name.to_string(),
                })?;
            parts.push(format!("{}(*)", relation.table));
        }
        Ok(parts.join(","))
    }

    /// 监听存储变更
    pub fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.store.contains(id)
    }

    /// 某个选择表达式是否已完成全量加载
    pub fn is_loaded(&self, key: &str) -> bool {
        self.markers.is_loaded(key)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// 从行中取出主键
    pub(super) fn row_id(&self, row: &crate::models::Row) -> Result<EntityId> {
        row.get(&self.config.id_field)
            .and_then(EntityId::from_value)
            .ok_or_else(|| {
                CacheError::InvalidRecord(format!(
                    "{} 的记录缺少有效的 {} 字段",
                    self.table, self.config.id_field
                ))
            })
    }

    /// 按给定主键顺序取出缓存中的记录（缺失的跳过）
    pub(super) fn collect_refs(&self, ids: &[EntityId]) -> Vec<EntityRef> {
        ids.iter().filter_map(|id| self.store.get(id)).collect()
    }
}

impl fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCache")
            .field("table", &self.table)
            .field("relations", &self.relations)
            .field("len", &self.store.len())
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl Drop for EntityCache {
    fn drop(&mut self) {
        if let Some(subscription) = self.realtime.get_mut().take() {
            subscription.cancel.cancel();
            subscription.task.abort();
        }
    }
}

/// 缓存构建器
pub struct EntityCacheBuilder {
    table: String,
    backend: Arc<dyn Backend>,
    relations: Vec<RelationDef>,
    config: CacheConfig,
}

impl EntityCacheBuilder {
    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn relations(mut self, relations: impl IntoIterator<Item = RelationDef>) -> Self {
        self.relations.extend(relations);
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// 构建缓存
    ///
    /// 只校验声明本身（关系名唯一、占位规则合法），不会解析任何关系目标。
    pub fn build(self) -> Result<Arc<EntityCache>> {
        let placeholder = Regex::new(&self.config.placeholder_pattern).map_err(|e| {
            CacheError::Config(format!(
                "无效的占位 ID 规则 {}: {e}",
                self.config.placeholder_pattern
            ))
        })?;

        for (index, relation) in self.relations.iter().enumerate() {
            if relation.name == self.config.id_field {
                return Err(CacheError::Schema(format!(
                    "{} 的关系名 {} 与主键字段冲突",
                    self.table, relation.name
                )));
            }
            if self.relations[..index].iter().any(|r| r.name == relation.name) {
                return Err(CacheError::Schema(format!(
                    "{} 重复声明了关系 {}",
                    self.table, relation.name
                )));
            }
        }

        tracing::debug!(
            table = %self.table,
            relations = ?self.relations.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            "创建实体缓存"
        );

        Ok(Arc::new(EntityCache {
            store: KeyedStore::new(self.config.event_buffer, self.config.version_field.clone()),
            markers: LoadMarkers::new(),
            realtime: Mutex::new(None),
            subscribed: Arc::new(AtomicBool::new(false)),
            table: self.table,
            backend: self.backend,
            relations: self.relations,
            config: self.config,
            placeholder,
        }))
    }
}
