// 全局配置结构：日志配置 + 缓存行为配置 + 后端连接配置
//
// 可从 TOML 加载，所有字段均有默认值：
//
// ```toml
// [log]
// level = "debug"
// output = "both"
//
// [cache]
// placeholder_pattern = "^_tmp"
// version_field = "updated_at"
// ```

use serde::{Deserialize, Serialize};
use std::path::Path;

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// 日志输出目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub output: LogOutput,
    /// 日志目录（文件输出时使用，默认 ~/.entity-cache/logs）
    #[serde(default)]
    pub file_path: Option<String>,
}

/// 缓存行为配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 主键字段名
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// 全字段选择表达式
    #[serde(default = "default_select_all")]
    pub select_all: String,
    /// 客户端占位 ID 的匹配规则（正则），匹配的 ID 在 `save` 时被剥离
    #[serde(default = "default_placeholder_pattern")]
    pub placeholder_pattern: String,
    /// 生成占位 ID 时使用的前缀
    #[serde(default = "default_placeholder_prefix")]
    pub placeholder_prefix: String,
    /// 版本字段（可选）：设置后，版本更旧的行不会覆盖缓存中的记录
    #[serde(default)]
    pub version_field: Option<String>,
    /// 缓存变更通知的广播容量
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// 实时订阅的 schema
    #[serde(default = "default_realtime_schema")]
    pub realtime_schema: String,
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_select_all() -> String {
    "*".to_string()
}

fn default_placeholder_pattern() -> String {
    "^_new".to_string()
}

fn default_placeholder_prefix() -> String {
    "_new".to_string()
}

fn default_event_buffer() -> usize {
    256
}

fn default_realtime_schema() -> String {
    "public".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            id_field: default_id_field(),
            select_all: default_select_all(),
            placeholder_pattern: default_placeholder_pattern(),
            placeholder_prefix: default_placeholder_prefix(),
            version_field: None,
            event_buffer: default_event_buffer(),
            realtime_schema: default_realtime_schema(),
        }
    }
}

/// PostgREST 后端连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// 项目地址（如 `https://xyz.supabase.co`），请求路径为 `<url>/rest/v1/<table>`
    pub url: String,
    /// 匿名/服务端 API Key（`apikey` 请求头）
    pub api_key: String,
    /// 用户访问令牌；为空时使用 `api_key` 作为 Bearer
    #[serde(default)]
    pub access_token: Option<String>,
    /// 非 public schema 时设置
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// 应用配置（日志 + 缓存 + 后端）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rest: Option<RestConfig>,
}

impl AppConfig {
    /// 从 TOML 文本解析
    pub fn from_toml_str(content: &str) -> crate::data::Result<Self> {
        toml::from_str(content).map_err(|e| crate::data::CacheError::Config(e.to_string()))
    }

    /// 从 TOML 文件加载
    pub fn load(path: &Path) -> crate::data::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::data::CacheError::Config(format!("读取配置文件失败 {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}
