//! 缓存注册表
//!
//! 每张表一个单例缓存，存储名为 `entity-<table>`。
//! 注册时只保存声明，第一次访问时才实例化；关系目标通过 `lazy` 工厂按需解析，
//! 因此 A ↔ B 这样的环形关系可以按任意顺序注册。

use crate::data::{CacheError, Result};
use crate::models::config::CacheConfig;
use crate::services::backend::Backend;
use crate::services::entity_cache::{CacheFactory, EntityCache, RelationDef};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

const STORE_PREFIX: &str = "entity-";

struct CacheSlot {
    relations: Vec<RelationDef>,
    config: CacheConfig,
    cache: OnceCell<Arc<EntityCache>>,
}

/// 缓存注册表
pub struct CacheRegistry {
    backend: Arc<dyn Backend>,
    config: CacheConfig,
    slots: RwLock<HashMap<String, Arc<CacheSlot>>>,
    this: Weak<CacheRegistry>,
}

impl CacheRegistry {
    pub fn new(backend: Arc<dyn Backend>, config: CacheConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            backend,
            config,
            slots: RwLock::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// 表对应的存储名
    pub fn store_name(table: &str) -> String {
        format!("{STORE_PREFIX}{table}")
    }

    /// 注册一张表（使用注册表的默认配置）
    pub fn define(
        &self,
        table: &str,
        relations: impl IntoIterator<Item = RelationDef>,
    ) -> Result<CacheAccessor> {
        self.define_with_config(table, relations, self.config.clone())
    }

    /// 注册一张表，同一张表只能注册一次
    pub fn define_with_config(
        &self,
        table: &str,
        relations: impl IntoIterator<Item = RelationDef>,
        config: CacheConfig,
    ) -> Result<CacheAccessor> {
        let store_name = Self::store_name(table);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);

        if slots.contains_key(&store_name) {
            return Err(CacheError::DuplicateCache(store_name));
        }

        slots.insert(
            store_name.clone(),
            Arc::new(CacheSlot {
                relations: relations.into_iter().collect(),
                config,
                cache: OnceCell::new(),
            }),
        );
        tracing::debug!(store = %store_name, "注册缓存");

        Ok(CacheAccessor {
            registry: self.this.clone(),
            table: table.to_string(),
        })
    }

    /// 获取（必要时创建）某张表的缓存
    pub fn cache(&self, table: &str) -> Result<Arc<EntityCache>> {
        let store_name = Self::store_name(table);
        let slot = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&store_name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownCache(store_name.clone()))?;

        slot.cache
            .get_or_try_init(|| {
                tracing::debug!(store = %store_name, "实例化缓存");
                EntityCache::builder(table, Arc::clone(&self.backend))
                    .relations(slot.relations.iter().cloned())
                    .config(slot.config.clone())
                    .build()
            })
            .cloned()
    }

    /// 惰性工厂：调用时才从注册表解析目标缓存
    pub fn lazy(&self, table: &str) -> CacheFactory {
        let registry = self.this.clone();
        let table = table.to_string();
        Arc::new(move || {
            registry
                .upgrade()
                .ok_or_else(|| CacheError::UnknownCache(Self::store_name(&table)))?
                .cache(&table)
        })
    }

    /// 已注册的表名
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter_map(|name| name.strip_prefix(STORE_PREFIX).map(str::to_string))
            .collect();
        tables.sort();
        tables
    }

    /// 取消所有已实例化缓存的实时订阅
    pub async fn unsubscribe_all(&self) {
        let caches: Vec<Arc<EntityCache>> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|slot| slot.cache.get().cloned())
            .filter(|cache| cache.is_subscribed())
            .collect();

        futures_util::future::join_all(caches.iter().map(|cache| cache.unsubscribe())).await;
    }
}

/// 单张表的访问器
#[derive(Clone)]
pub struct CacheAccessor {
    registry: Weak<CacheRegistry>,
    table: String,
}

impl CacheAccessor {
    pub fn get(&self) -> Result<Arc<EntityCache>> {
        self.registry
            .upgrade()
            .ok_or_else(|| CacheError::UnknownCache(self.store_name()))?
            .cache(&self.table)
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn store_name(&self) -> String {
        CacheRegistry::store_name(&self.table)
    }
}

impl std::fmt::Debug for CacheAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAccessor")
            .field("store", &self.store_name())
            .finish()
    }
}
