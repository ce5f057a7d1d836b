//! 读取模块
//!
//! 负责批量加载、单条查找、自定义查询与本地读取

use super::EntityCache;
use crate::data::{CacheError, Result};
use crate::models::{EntityId, EntityRef};
use crate::services::backend::{Filter, SelectQuery};

/// `select` / `query` 的选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectOptions {
    /// 需要一并嵌入的关系名（按顺序生成子选择）
    pub include: Vec<String>,
}

impl SelectOptions {
    pub fn include<I, S>(relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: relations.into_iter().map(Into::into).collect(),
        }
    }
}

/// `find` 的选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// 忽略缓存，强制请求后端
    pub reload: bool,
    pub include: Vec<String>,
}

impl FindOptions {
    pub fn reload() -> Self {
        Self {
            reload: true,
            ..Default::default()
        }
    }

    pub fn with_include<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = relations.into_iter().map(Into::into).collect();
        self
    }
}

impl EntityCache {
    /// 全量加载
    ///
    /// 同一选择表达式只请求一次后端，之后直接返回缓存内容（不会自动失效）。
    pub async fn select(&self, options: &SelectOptions) -> Result<Vec<EntityRef>> {
        let key = self.get_key(None, &options.include)?;

        if self.markers.is_loaded(&key) {
            tracing::debug!(table = %self.table, key = %key, "命中全量加载缓存");
            return Ok(self.store.all());
        }

        tracing::debug!(table = %self.table, key = %key, "全量加载");
        let rows = self.backend.select(&self.table, &SelectQuery::new(&key)).await?;
        let entities = self.add(rows)?;
        self.markers.mark(&key);

        tracing::debug!(table = %self.table, key = %key, count = entities.len(), "全量加载完成");
        Ok(entities)
    }

    /// 按主键查找
    ///
    /// 已缓存且未要求 `reload` 时不访问后端。
    pub async fn find(&self, id: impl Into<EntityId>, options: &FindOptions) -> Result<EntityRef> {
        let id = id.into();

        if !options.reload {
            if let Some(entity) = self.store.get(&id) {
                tracing::trace!(table = %self.table, id = %id, "命中缓存");
                return Ok(entity);
            }
        }

        let key = self.get_key(None, &options.include)?;
        let query =
            SelectQuery::new(key).filter(Filter::eq(self.config.id_field.as_str(), id.to_value()));
        let rows = self.backend.select(&self.table, &query).await?;

        if rows.is_empty() {
            return Err(CacheError::not_found(&self.table, &id));
        }

        // 后端可能以另一种类型返回主键（"42" → 42），以返回行为准
        self.add(rows)?
            .into_iter()
            .find(|entity| entity.id() == &id)
            .ok_or_else(|| CacheError::not_found(&self.table, &id))
    }

    /// 自定义查询
    ///
    /// 回调拿到基础查询（选择表达式已生成），可以追加任意过滤与排序；
    /// 结果归一化后返回，不影响全量加载标记。
    pub async fn query<F>(&self, build: F, options: &SelectOptions) -> Result<Vec<EntityRef>>
    where
        F: FnOnce(SelectQuery) -> SelectQuery,
    {
        let key = self.get_key(None, &options.include)?;
        let query = build(SelectQuery::new(key));

        tracing::debug!(
            table = %self.table,
            key = %query.columns,
            filters = query.filters.len(),
            "执行查询"
        );
        let rows = self.backend.select(&self.table, &query).await?;
        self.add(rows)
    }

    /// 读取缓存中的记录（不访问后端）
    pub fn peek(&self, id: impl Into<EntityId>) -> Option<EntityRef> {
        self.store.get(&id.into())
    }

    /// 缓存中的所有记录，顺序不保证
    pub fn peek_all(&self) -> Vec<EntityRef> {
        self.store.all()
    }
}
