//! 统一错误类型定义
//!
//! 使用 `thiserror` 定义缓存层的所有错误类型。后端错误原样透传，不包装、不重试，
//! 是否重试由调用方决定。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 后端返回的错误（PostgREST 错误体结构）
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
    /// HTTP 状态码（非 HTTP 后端为空）
    #[serde(skip)]
    pub status: Option<u16>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
            hint: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// 缓存层的统一错误类型
#[derive(Error, Debug)]
pub enum CacheError {
    /// 后端调用失败（原样透传）
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// 期望恰好一行，后端返回零行
    #[error("未找到 {table}:{id}")]
    NotFound { table: String, id: String },

    /// 期望恰好一行，后端影响了多行
    #[error("数据完整性错误: 删除 {table}:{id} 影响了 {affected} 行")]
    Integrity {
        table: String,
        id: String,
        affected: usize,
    },

    /// 批量操作返回的行数与请求的主键数不一致，或部分行带有错误
    #[error("批量操作未全部完成: {table} 请求 {requested} 行，实际 {affected} 行")]
    PartialFailure {
        table: String,
        requested: usize,
        affected: usize,
        errors: Vec<Value>,
    },

    /// 写入成功但没有返回任何行（通常是行级安全策略拒绝）
    #[error("写入 {table} 未返回任何行，可能被行级安全策略拒绝")]
    Rejected { table: String },

    /// 嵌套载荷与声明的关系结构不匹配
    #[error("关系结构不匹配: {0}")]
    Schema(String),

    /// 引用了未声明的关系
    #[error("未声明的关系: {table}.{relation}")]
    UnknownRelation { table: String, relation: String },

    /// 缓存未注册
    #[error("未注册的缓存: {0}")]
    UnknownCache(String),

    /// 缓存重复注册
    #[error("缓存已注册: {0}")]
    DuplicateCache(String),

    /// 记录缺少主键或不是对象
    #[error("无效的记录: {0}")]
    InvalidRecord(String),

    /// JSON 序列化/反序列化错误
    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

/// 便于与现有代码集成的类型别名
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    pub fn not_found(table: &str, id: impl ToString) -> Self {
        Self::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        }
    }

    /// 是否为后端透传的错误
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}
