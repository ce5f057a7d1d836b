//! 归一化模块
//!
//! 把带嵌套关系的原始行拆开：子实体交给目标缓存，父记录只保留引用。

use super::{Cardinality, EntityCache, RelationDef};
use crate::data::{CacheError, Result};
use crate::models::{EntityId, EntityRef, Related, Row};
use serde_json::Value;

impl EntityCache {
    /// 归一化并缓存一批原始行，按输入顺序返回缓存中的记录
    ///
    /// - 已存在的主键在原槽位上逐字段合并
    /// - 每个声明的关系：若行中出现其表名字段，则递归交给目标缓存归一化，
    ///   父记录上以关系名保存引用，表名字段从普通字段中移除
    /// - 嵌套值为 null 时跳过该关系
    /// - 启用版本守卫时，更旧的行整体忽略（字段、子实体与关系引用都不写入）
    ///
    /// 某一行出错时立即返回，之前的行已经生效。
    pub fn add(&self, rows: Vec<Row>) -> Result<Vec<EntityRef>> {
        let count = rows.len();
        let entities = rows
            .into_iter()
            .map(|row| self.add_one(row))
            .collect::<Result<Vec<_>>>()?;

        tracing::trace!(table = %self.table, count, "归一化完成");
        Ok(entities)
    }

    fn add_one(&self, mut row: Row) -> Result<EntityRef> {
        let id = self.row_id(&row)?;

        if self.store.is_stale_row(&id, &row) {
            if let Some(existing) = self.store.get(&id) {
                tracing::debug!(table = %self.table, id = %id, "忽略版本更旧的行");
                return Ok(existing);
            }
        }

        // 子实体先归一化，父记录只在全部关系成功后写入
        let mut resolved = Vec::new();
        for relation in &self.relations {
            let Some(payload) = row.remove(&relation.table) else {
                continue;
            };
            // 关系名字段由引用取代
            row.remove(&relation.name);
            if payload.is_null() {
                continue;
            }

            let children = split_payload(&self.table, relation, payload)?;
            let target = relation.resolve()?;
            let mut entities = target.add(children)?;

            let related = match relation.cardinality {
                Cardinality::One => match entities.pop() {
                    Some(entity) => Related::One(entity),
                    None => continue,
                },
                Cardinality::Many => Related::Many(entities),
            };
            resolved.push((relation.name.clone(), related));
        }

        let outcome = self.store.upsert(id, row);
        // 子实体归一化期间可能有更新的版本写入
        if !outcome.is_stale() && !resolved.is_empty() {
            let mut record = outcome.entity().write();
            for (name, related) in resolved {
                record.set_related(name, related);
            }
        }

        Ok(outcome.into_entity())
    }

    /// 从本地缓存移除一条记录（不访问后端）
    pub fn remove(&self, id: impl Into<EntityId>) -> Option<EntityRef> {
        let id = id.into();
        let removed = self.store.remove(&id);
        if removed.is_some() {
            tracing::trace!(table = %self.table, id = %id, "移除缓存记录");
        }
        removed
    }
}

/// 按声明的基数拆分嵌套载荷
fn split_payload(table: &str, relation: &RelationDef, payload: Value) -> Result<Vec<Row>> {
    let mismatch = |expected: &str, actual: &Value| {
        CacheError::Schema(format!(
            "{table}.{} 期望{expected}，实际为 {}",
            relation.name,
            kind_of(actual)
        ))
    };

    match (relation.cardinality, payload) {
        (Cardinality::One, Value::Object(row)) => Ok(vec![row]),
        (Cardinality::Many, Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(mismatch("对象数组", &other)),
            })
            .collect(),
        (Cardinality::One, other) => Err(mismatch("单个对象", &other)),
        (Cardinality::Many, other) => Err(mismatch("对象数组", &other)),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
