//! 缓存层实现
//!
//! - `store`: 主键 → 实体槽位（原地合并 + 变更广播）
//! - `markers`: 全量加载标记（按选择表达式）

pub mod markers;
pub mod store;

pub use markers::LoadMarkers;
pub use store::{KeyedStore, StoreEvent, Upsert};
