//! 缓存数据层
//!
//! 提供实体缓存的底层存储与统一错误类型。
//!
//! # 模块组织
//!
//! - `error`: 统一错误类型定义
//! - `cache`: 主键存储与加载标记

pub mod cache;
pub mod error;

pub use cache::{KeyedStore, LoadMarkers, StoreEvent, Upsert};
pub use error::{BackendError, CacheError, Result};
