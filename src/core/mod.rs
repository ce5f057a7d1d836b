//! 核心基础设施：日志与 HTTP 客户端

pub mod http;
pub mod logger;

pub use http::build_http_client;
pub use logger::{init_logger, update_log_level};
