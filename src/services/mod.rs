// 服务层
//
// - backend: 远端数据后端接口与实现
// - entity_cache: 单表实体缓存
// - registry: 每表单例的缓存注册表

pub mod backend;
pub mod entity_cache;
pub mod registry;

pub use backend::{Backend, ChangeFeed, Filter, FilterOp, MemoryBackend, RestBackend, SelectQuery};
pub use entity_cache::{
    CacheFactory, Cardinality, EntityCache, EntityCacheBuilder, FindOptions, RelationDef,
    SelectOptions,
};
pub use registry::{CacheAccessor, CacheRegistry};
