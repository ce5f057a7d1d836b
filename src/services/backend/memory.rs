// 进程内后端
//
// 用 HashMap 模拟远端表，行为尽量贴近 PostgREST：
// - 写操作返回受影响行的最新内容
// - 通过声明的外键支持 `users(*)` 形式的嵌入查询（多对一返回对象，一对多返回数组）
// - 每次写操作都会向该表的订阅者推送变更事件
// - 记录所有调用，并支持为下一次调用注入错误，便于断言缓存的网络行为

use super::query::{parse_selection, Filter, FilterOp, SelectQuery, Selection};
use super::{Backend, BackendResult, ChangeFeed};
use crate::data::BackendError;
use crate::models::{ChangeEvent, Row};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// 后端操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Subscribe,
}

/// 一次后端调用的记录
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    pub table: String,
    pub operation: Operation,
    /// select 的完整查询
    pub query: Option<SelectQuery>,
    /// update/delete 的过滤条件
    pub filter: Option<Filter>,
}

/// 外键声明：`from_table.column` → `to_table.id`
#[derive(Debug, Clone)]
struct ForeignKey {
    from_table: String,
    column: String,
    to_table: String,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    foreign_keys: Vec<ForeignKey>,
    calls: Vec<BackendCall>,
    failures: HashMap<(String, Operation), BackendError>,
    feeds: HashMap<String, Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    next_id: i64,
}

/// 进程内后端
pub struct MemoryBackend {
    state: Mutex<State>,
    id_field: String,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_id_field("id")
    }

    pub fn with_id_field(id_field: &str) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..Default::default()
            }),
            id_field: id_field.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 追加种子数据（非对象值会被忽略），不产生调用记录和变更事件
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut state = self.lock();
        let rows: Vec<Row> = rows
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();

        let max_id = rows
            .iter()
            .filter_map(|r| r.get(&self.id_field).and_then(Value::as_i64))
            .max()
            .unwrap_or(0);
        state.next_id = state.next_id.max(max_id + 1);

        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// 声明外键，供嵌入查询使用
    pub fn link(&self, from_table: &str, column: &str, to_table: &str) {
        self.lock().foreign_keys.push(ForeignKey {
            from_table: from_table.to_string(),
            column: column.to_string(),
            to_table: to_table.to_string(),
        });
    }

    /// 让某张表的下一次指定操作失败
    pub fn fail_next(&self, table: &str, operation: Operation, error: BackendError) {
        self.lock()
            .failures
            .insert((table.to_string(), operation), error);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, table: &str, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.table == table && c.operation == operation)
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// 当前表内容
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// 仍然存活的订阅者数量
    pub fn subscriber_count(&self, table: &str) -> usize {
        self.lock()
            .feeds
            .get(table)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// 手动推送一条变更事件（模拟其他客户端的写入）
    pub fn emit(&self, event: ChangeEvent) {
        let mut state = self.lock();
        Self::broadcast(&mut state, event);
    }

    fn broadcast(state: &mut State, event: ChangeEvent) {
        if let Some(senders) = state.feeds.get_mut(&event.table) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// 记录调用并取出注入的错误
    fn begin(
        &self,
        state: &mut State,
        table: &str,
        operation: Operation,
        query: Option<&SelectQuery>,
        filter: Option<&Filter>,
    ) -> BackendResult<()> {
        state.calls.push(BackendCall {
            table: table.to_string(),
            operation,
            query: query.cloned(),
            filter: filter.cloned(),
        });

        match state.failures.remove(&(table.to_string(), operation)) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn project(&self, state: &State, table: &str, row: &Row, selection: &Selection) -> BackendResult<Row> {
        let mut out = if selection.all_columns {
            row.clone()
        } else {
            selection
                .columns
                .iter()
                .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                .collect()
        };

        for embed in &selection.embeds {
            let value = self.embed(state, table, row, embed)?;
            out.insert(embed.clone(), value);
        }

        Ok(out)
    }

    fn embed(&self, state: &State, table: &str, row: &Row, embed: &str) -> BackendResult<Value> {
        let empty = Vec::new();
        let target_rows = state.tables.get(embed).unwrap_or(&empty);

        // 多对一：本表持有外键
        if let Some(fk) = state
            .foreign_keys
            .iter()
            .find(|fk| fk.from_table == table && fk.to_table == embed)
        {
            let target = row.get(&fk.column).unwrap_or(&Value::Null);
            let found = target_rows.iter().find(|r| {
                r.get(&self.id_field)
                    .is_some_and(|id| values_equal(id, target))
            });
            return Ok(found.cloned().map(Value::Object).unwrap_or(Value::Null));
        }

        // 一对多：关联表持有指向本表的外键
        if let Some(fk) = state
            .foreign_keys
            .iter()
            .find(|fk| fk.from_table == embed && fk.to_table == table)
        {
            let id = row.get(&self.id_field).unwrap_or(&Value::Null);
            let children = target_rows
                .iter()
                .filter(|r| r.get(&fk.column).is_some_and(|v| values_equal(v, id)))
                .cloned()
                .map(Value::Object)
                .collect();
            return Ok(Value::Array(children));
        }

        Err(BackendError::new(format!(
            "Could not find a relationship between '{table}' and '{embed}' in the schema cache"
        ))
        .with_code("PGRST200"))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, table: &str, query: &SelectQuery) -> BackendResult<Vec<Row>> {
        self.begin(&mut self.lock(), table, Operation::Select, Some(query), None)?;
        // 模拟网络边界：让出执行权
        tokio::task::yield_now().await;

        let state = self.lock();
        let mut rows: Vec<Row> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| query.filters.iter().all(|f| matches(f, r)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by(|a, b| {
            for order in &query.order {
                let ord = compare(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                )
                .unwrap_or(Ordering::Equal);
                let ord = if order.ascending { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        let selection = parse_selection(&query.columns);
        rows.iter()
            .map(|row| self.project(&state, table, row, &selection))
            .collect()
    }

    async fn insert(&self, table: &str, mut row: Row) -> BackendResult<Vec<Row>> {
        self.begin(&mut self.lock(), table, Operation::Insert, None, None)?;
        tokio::task::yield_now().await;

        let mut state = self.lock();
        let has_id = row
            .get(&self.id_field)
            .is_some_and(|v| !v.is_null());
        if !has_id {
            let id = state.next_id;
            state.next_id += 1;
            row.insert(self.id_field.clone(), Value::from(id));
        }

        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Self::broadcast(&mut state, ChangeEvent::insert(table, row.clone()));

        Ok(vec![row])
    }

    async fn update(&self, table: &str, patch: Row, filter: &Filter) -> BackendResult<Vec<Row>> {
        self.begin(&mut self.lock(), table, Operation::Update, None, Some(filter))?;
        tokio::task::yield_now().await;

        let mut state = self.lock();
        let mut events = Vec::new();
        let mut updated = Vec::new();

        if let Some(rows) = state.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| matches(filter, r)) {
                let old = row.clone();
                for (key, value) in &patch {
                    row.insert(key.clone(), value.clone());
                }
                events.push(ChangeEvent::update(table, row.clone(), old));
                updated.push(row.clone());
            }
        }

        for event in events {
            Self::broadcast(&mut state, event);
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> BackendResult<Vec<Row>> {
        self.begin(&mut self.lock(), table, Operation::Delete, None, Some(filter))?;
        tokio::task::yield_now().await;

        let mut state = self.lock();
        let mut removed = Vec::new();

        if let Some(rows) = state.tables.get_mut(table) {
            let (gone, kept): (Vec<Row>, Vec<Row>) =
                rows.drain(..).partition(|r| matches(filter, r));
            *rows = kept;
            removed = gone;
        }

        for row in &removed {
            Self::broadcast(&mut state, ChangeEvent::delete(table, row.clone()));
        }
        Ok(removed)
    }

    async fn subscribe(&self, table: &str) -> BackendResult<ChangeFeed> {
        let mut state = self.lock();
        self.begin(&mut state, table, Operation::Subscribe, None, None)?;

        let (tx, feed) = ChangeFeed::channel();
        state.feeds.entry(table.to_string()).or_default().push(tx);
        Ok(feed)
    }
}

/// 比较两个 JSON 标量（数字按数值、字符串按字典序）
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare(a, b) == Some(Ordering::Equal) || a == b
}

/// `%` → 任意串，`_` → 单字符
fn like_regex(pattern: &str, case_insensitive: bool) -> Option<Regex> {
    let mut expr = String::from(if case_insensitive { "(?i)^" } else { "^" });
    for ch in pattern.chars() {
        match ch {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}

fn matches(filter: &Filter, row: &Row) -> bool {
    let value = row.get(&filter.column).unwrap_or(&Value::Null);
    match filter.op {
        FilterOp::Eq => values_equal(value, &filter.value),
        FilterOp::Neq => !values_equal(value, &filter.value),
        FilterOp::Gt => compare(value, &filter.value) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(
            compare(value, &filter.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Lt => compare(value, &filter.value) == Some(Ordering::Less),
        FilterOp::Lte => matches!(
            compare(value, &filter.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::In => filter
            .value
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| values_equal(value, c))),
        FilterOp::Is => value == &filter.value,
        FilterOp::Like | FilterOp::ILike => {
            let (Some(text), Some(pattern)) = (value.as_str(), filter.value.as_str()) else {
                return false;
            };
            like_regex(pattern, filter.op == FilterOp::ILike).is_some_and(|re| re.is_match(text))
        }
    }
}
