pub mod change;
pub mod config;
pub mod record;

pub use change::{ChangeEvent, ChangeKind};
pub use config::{AppConfig, CacheConfig, LogConfig, LogFormat, LogLevel, LogOutput, RestConfig};
pub use record::{EntityId, EntityRef, Record, Related, Row};
