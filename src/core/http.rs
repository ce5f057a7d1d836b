use crate::data::BackendError;
use crate::models::config::RestConfig;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;

const USER_AGENT: &str = concat!("entity-cache/", env!("CARGO_PKG_VERSION"));

/// 构建访问 PostgREST 的 HTTP 客户端
///
/// 每个请求默认携带：
/// - `apikey: <api_key>`
/// - `Authorization: Bearer <access_token 或 api_key>`
pub fn build_http_client(config: &RestConfig) -> Result<Client, BackendError> {
    let headers = build_auth_headers(config)?;

    Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(std::time::Duration::from_secs(config.timeout_secs))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(|e| BackendError::new(format!("创建 HTTP 客户端失败: {e}")))
}

/// 认证请求头
fn build_auth_headers(config: &RestConfig) -> Result<HeaderMap, BackendError> {
    let token = config
        .access_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .unwrap_or(&config.api_key);

    let mut headers = HeaderMap::new();
    headers.insert("apikey", header_value(&config.api_key)?);
    headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, BackendError> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|e| BackendError::new(format!("API Key 含非法字符: {e}")))?;
    value.set_sensitive(true);
    Ok(value)
}
