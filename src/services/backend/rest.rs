//! PostgREST HTTP 后端
//!
//! 请求约定：
//! - `GET    /rest/v1/<table>?select=*,users(*)&id=eq.1&order=created_at.desc&limit=20`
//! - `POST   /rest/v1/<table>`           （`Prefer: return=representation`）
//! - `PATCH  /rest/v1/<table>?id=in.(1,2)`（同上）
//! - `DELETE /rest/v1/<table>?id=eq.1`    （同上）
//!
//! 非 2xx 响应的错误体（`{code, message, details, hint}`）原样映射为 `BackendError`。
//! 该后端不提供实时通道，`subscribe` 直接返回错误。

use super::query::{Filter, FilterOp, SelectQuery};
use super::{Backend, BackendResult, ChangeFeed};
use crate::core::http::build_http_client;
use crate::data::BackendError;
use crate::models::config::RestConfig;
use crate::models::Row;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use url::Url;

const PREFER_REPRESENTATION: &str = "return=representation";

/// PostgREST 后端
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: Client,
    base_url: Url,
    schema: Option<String>,
}

impl RestBackend {
    pub fn new(config: RestConfig) -> BackendResult<Self> {
        let client = build_http_client(&config)?;
        let base_url = Url::parse(&format!("{}/rest/v1/", config.url.trim_end_matches('/')))
            .map_err(|e| BackendError::new(format!("无效的后端地址 {}: {e}", config.url)))?;

        Ok(Self {
            client,
            base_url,
            schema: config.schema,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> BackendResult<Url> {
        self.base_url
            .join(&urlencoding::encode(table))
            .map_err(|e| BackendError::new(format!("无效的表名 {table}: {e}")))
    }

    fn select_url(&self, table: &str, query: &SelectQuery) -> BackendResult<Url> {
        let mut url = self.table_url(table)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", &query.columns);
            for filter in &query.filters {
                let (column, value) = filter_param(filter);
                pairs.append_pair(&column, &value);
            }
            if !query.order.is_empty() {
                let order = query
                    .order
                    .iter()
                    .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
                    .collect::<Vec<_>>()
                    .join(",");
                pairs.append_pair("order", &order);
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url)
    }

    fn filtered_url(&self, table: &str, filter: &Filter) -> BackendResult<Url> {
        let mut url = self.table_url(table)?;
        let (column, value) = filter_param(filter);
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair(&column, &value);
        Ok(url)
    }

    async fn execute(&self, method: Method, url: Url, body: Option<Row>) -> BackendResult<Vec<Row>> {
        let is_read = method == Method::GET;
        tracing::debug!(method = %method, url = %url, "发送后端请求");

        let mut request = self.client.request(method, url);
        if !is_read {
            request = request.header("Prefer", PREFER_REPRESENTATION);
        }
        if let Some(schema) = &self.schema {
            let header = if is_read { "Accept-Profile" } else { "Content-Profile" };
            request = request.header(header, schema.as_str());
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::new(format!("请求失败: {e}")).with_code("NETWORK"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::new(format!("读取响应失败: {e}")).with_status(status.as_u16()))?;

        if !status.is_success() {
            let error = serde_json::from_str::<BackendError>(&text).unwrap_or_else(|_| {
                let message = if text.trim().is_empty() {
                    status.to_string()
                } else {
                    text.clone()
                };
                BackendError::new(message)
            });
            tracing::debug!(status = status.as_u16(), code = ?error.code, "后端返回错误");
            return Err(error.with_status(status.as_u16()));
        }

        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str::<Vec<Row>>(&text)
            .map_err(|e| BackendError::new(format!("响应解析失败: {e}")).with_status(status.as_u16()))
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(&self, table: &str, query: &SelectQuery) -> BackendResult<Vec<Row>> {
        let url = self.select_url(table, query)?;
        self.execute(Method::GET, url, None).await
    }

    async fn insert(&self, table: &str, row: Row) -> BackendResult<Vec<Row>> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut().append_pair("select", "*");
        self.execute(Method::POST, url, Some(row)).await
    }

    async fn update(&self, table: &str, patch: Row, filter: &Filter) -> BackendResult<Vec<Row>> {
        let url = self.filtered_url(table, filter)?;
        self.execute(Method::PATCH, url, Some(patch)).await
    }

    async fn delete(&self, table: &str, filter: &Filter) -> BackendResult<Vec<Row>> {
        let url = self.filtered_url(table, filter)?;
        self.execute(Method::DELETE, url, None).await
    }

    async fn subscribe(&self, table: &str) -> BackendResult<ChangeFeed> {
        Err(
            BackendError::new(format!("RestBackend 不提供实时通道，无法订阅 {table}"))
                .with_code("REALTIME_UNSUPPORTED"),
        )
    }
}

/// 过滤条件 → 查询参数（`id` → `eq.1`，`id` → `in.(1,2)`）
fn filter_param(filter: &Filter) -> (String, String) {
    let value = match (&filter.op, &filter.value) {
        (FilterOp::In, Value::Array(items)) => {
            let items: Vec<String> = items.iter().map(render_list_item).collect();
            format!("in.({})", items.join(","))
        }
        (op, value) => format!("{}.{}", op.as_str(), render_value(value)),
    };
    (filter.column.clone(), value)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// 列表元素中含保留字符的字符串需要加双引号
fn render_list_item(value: &Value) -> String {
    match value {
        Value::String(s) if s.contains([',', '(', ')', '"', '\\', ' ', ':']) => {
            format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
        }
        other => render_value(other),
    }
}
