//! 写操作模块
//!
//! 所有写操作先请求后端，后端确认成功后才用返回的行回填缓存。

use super::EntityCache;
use crate::data::{CacheError, Result};
use crate::models::{EntityId, EntityRef, Row};
use crate::services::backend::Filter;
use serde_json::Value;

impl EntityCache {
    /// 插入一行，返回缓存中的新记录
    ///
    /// 后端没有返回任何行时视为被拒绝（通常是行级安全策略）。
    pub async fn insert(&self, data: Row) -> Result<EntityRef> {
        let rows = self.backend.insert(&self.table, data).await?;

        let Some(row) = rows.into_iter().next() else {
            tracing::warn!(table = %self.table, "插入未返回任何行");
            return Err(CacheError::Rejected {
                table: self.table.clone(),
            });
        };

        let id = self.row_id(&row)?;
        tracing::debug!(table = %self.table, id = %id, "插入成功");
        self.add_and_get(vec![row], &id)
    }

    /// 按主键更新，返回合并后的记录
    pub async fn update(&self, id: impl Into<EntityId>, patch: Row) -> Result<EntityRef> {
        let id = id.into();
        let rows = self
            .backend
            .update(&self.table, patch, &self.id_filter(&id))
            .await?;

        if rows.is_empty() {
            tracing::warn!(table = %self.table, id = %id, "更新未影响任何行");
            return Err(CacheError::not_found(&self.table, &id));
        }

        tracing::debug!(table = %self.table, id = %id, "更新成功");
        self.add_and_get(rows, &id)
    }

    /// 批量更新
    ///
    /// 返回行数与请求主键数不一致，或返回行中带有 `error` 字段时整体失败，缓存保持不变。
    pub async fn update_many(&self, ids: &[EntityId], patch: Row) -> Result<Vec<EntityRef>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self
            .backend
            .update(&self.table, patch, &self.ids_filter(ids))
            .await?;

        let errors: Vec<Value> = rows
            .iter()
            .filter_map(|row| row.get("error"))
            .filter(|error| !error.is_null())
            .cloned()
            .collect();

        if rows.len() != ids.len() || !errors.is_empty() {
            tracing::warn!(
                table = %self.table,
                requested = ids.len(),
                affected = rows.len(),
                errors = errors.len(),
                "批量更新未全部完成"
            );
            return Err(CacheError::PartialFailure {
                table: self.table.clone(),
                requested: ids.len(),
                affected: rows.len(),
                errors,
            });
        }

        self.add(rows)?;
        tracing::debug!(table = %self.table, count = ids.len(), "批量更新成功");
        Ok(self.collect_refs(ids))
    }

    /// 按主键删除
    ///
    /// - 零行：`NotFound`，缓存不变
    /// - 多行：`Integrity`（后端已执行删除，缓存不做处理）
    /// - 恰好一行：从缓存移除
    pub async fn delete(&self, id: impl Into<EntityId>) -> Result<()> {
        let id = id.into();
        let rows = self.backend.delete(&self.table, &self.id_filter(&id)).await?;

        match rows.len() {
            0 => {
                tracing::warn!(table = %self.table, id = %id, "删除未影响任何行");
                Err(CacheError::not_found(&self.table, &id))
            }
            1 => {
                self.store.remove(&id);
                tracing::debug!(table = %self.table, id = %id, "删除成功");
                Ok(())
            }
            affected => {
                tracing::error!(
                    table = %self.table,
                    id = %id,
                    affected,
                    "删除单条记录影响了多行"
                );
                Err(CacheError::Integrity {
                    table: self.table.clone(),
                    id: id.to_string(),
                    affected,
                })
            }
        }
    }

    /// 批量删除
    ///
    /// 返回行数与请求主键数不一致时整体失败，缓存保持不变。
    pub async fn delete_many(&self, ids: &[EntityId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let rows = self.backend.delete(&self.table, &self.ids_filter(ids)).await?;

        if rows.len() != ids.len() {
            tracing::warn!(
                table = %self.table,
                requested = ids.len(),
                affected = rows.len(),
                "批量删除未全部完成"
            );
            return Err(CacheError::PartialFailure {
                table: self.table.clone(),
                requested: ids.len(),
                affected: rows.len(),
                errors: Vec::new(),
            });
        }

        let removed = self.store.remove_many(ids);
        tracing::debug!(table = %self.table, count = removed, "批量删除成功");
        Ok(())
    }

    /// 新建或更新
    ///
    /// 先剥离关系名与关系表名字段；主键匹配占位规则时视为新建并丢弃主键。
    /// 剩余有效主键时走 `update`，否则走 `insert`。
    ///
    /// 整数主键 `0` 是有效主键，走 `update`（不按“假值”视为新建）。
    /// `"42"` 与 `42` 指向同一条记录。
    pub async fn save(&self, data: Row) -> Result<EntityRef> {
        let data = self.prepare_save(data);

        match data.get(&self.config.id_field).and_then(EntityId::from_value) {
            Some(id) => self.update(id, data).await,
            None => self.insert(data).await,
        }
    }

    fn prepare_save(&self, mut data: Row) -> Row {
        for relation in &self.relations {
            data.remove(&relation.table);
            data.remove(&relation.name);
        }

        let id_field = self.config.id_field.as_str();
        let drop_id = match data.get(id_field) {
            Some(Value::String(id)) => id.is_empty() || self.placeholder.is_match(id),
            Some(value) => EntityId::from_value(value).is_none(),
            None => false,
        };
        if drop_id {
            if let Some(id) = data.remove(id_field) {
                tracing::trace!(table = %self.table, id = %id, "丢弃占位主键");
            }
        }

        data
    }

    fn id_filter(&self, id: &EntityId) -> Filter {
        Filter::eq(self.config.id_field.as_str(), id.to_value())
    }

    fn ids_filter(&self, ids: &[EntityId]) -> Filter {
        Filter::in_list(
            self.config.id_field.as_str(),
            ids.iter().map(EntityId::to_value).collect(),
        )
    }

    fn add_and_get(&self, rows: Vec<Row>, id: &EntityId) -> Result<EntityRef> {
        let mut entities = self.add(rows)?;
        match entities.iter().position(|entity| entity.id() == id) {
            Some(index) => Ok(entities.swap_remove(index)),
            None => entities
                .into_iter()
                .next()
                .ok_or_else(|| CacheError::not_found(&self.table, id)),
        }
    }
}
