// lib.rs - 归一化实体缓存
//
// 为远端关系型表维护内存中的归一化镜像：按主键去重、嵌套关系拆分到各自的缓存、
// 写操作先落后端再回填、可选的实时变更同步。

pub mod core;
pub mod data;
pub mod models;
pub mod services;

pub use crate::core::{init_logger, update_log_level};
pub use crate::data::{BackendError, CacheError, Result, StoreEvent};
pub use models::{
    AppConfig, CacheConfig, ChangeEvent, ChangeKind, EntityId, EntityRef, LogConfig, Record,
    Related, RestConfig, Row,
};
pub use services::{
    Backend, CacheAccessor, CacheFactory, CacheRegistry, Cardinality, EntityCache, FindOptions,
    MemoryBackend, RelationDef, RestBackend, SelectOptions, SelectQuery,
};
