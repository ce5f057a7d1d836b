//! 远端数据后端接口
//!
//! 缓存只依赖表级别的 select/insert/update/delete（带过滤条件）以及按表订阅的变更流。
//! 具体实现：
//! - `MemoryBackend`: 进程内实现，记录每次调用，用于测试与离线演示
//! - `RestBackend`: PostgREST HTTP 实现

mod memory;
mod query;
mod rest;

pub use memory::{BackendCall, MemoryBackend, Operation};
pub use query::{parse_selection, Filter, FilterOp, Order, SelectQuery, Selection};
pub use rest::RestBackend;

use crate::data::BackendError;
use crate::models::{ChangeEvent, Row};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 后端调用结果
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// 远端数据后端
///
/// 所有写操作都应返回受影响行的最新内容（相当于 `.select('*')`），
/// 缓存据此回填，不做乐观更新。
#[async_trait]
pub trait Backend: Send + Sync {
    /// 查询：选择表达式 + 过滤 + 排序 + 限制
    async fn select(&self, table: &str, query: &SelectQuery) -> BackendResult<Vec<Row>>;

    /// 插入一行，返回插入后的行
    async fn insert(&self, table: &str, row: Row) -> BackendResult<Vec<Row>>;

    /// 按过滤条件更新，返回更新后的行
    async fn update(&self, table: &str, patch: Row, filter: &Filter) -> BackendResult<Vec<Row>>;

    /// 按过滤条件删除，返回被删除的行
    async fn delete(&self, table: &str, filter: &Filter) -> BackendResult<Vec<Row>>;

    /// 订阅某张表的 INSERT/UPDATE/DELETE 变更
    async fn subscribe(&self, table: &str) -> BackendResult<ChangeFeed>;
}

/// 单表变更流
///
/// 丢弃或关闭接收端即取消订阅，后端在下次推送时会清理失效的发送端。
#[derive(Debug)]
pub struct ChangeFeed {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(events: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { events }
    }

    /// 创建一对发送端/变更流
    pub fn channel() -> (mpsc::UnboundedSender<ChangeEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    /// 等待下一条变更，流关闭时返回 `None`
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        self.events.close();
    }
}
