//! HTTP 远端服务 - PostgREST 风格的表接口 + 组合端点
//!
//! - 表接口：`{base_url}/rest/v1/{table}`
//! - 组合端点：`{base_url}/api/{route}[/{key}]`
//! - change feed：`{base_url}/realtime/v1/changes`，按行分隔的 JSON 流

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    ChangeEvent, ChangeFeedSource, CompositeMethod, FeedMessage, RemoteResult, RemoteService, Row,
    SelectQuery,
};
use crate::config::RemoteConfig;
use crate::error::{CalendarSyncError, RemoteError, Result};
use crate::schema::RecordKey;
use crate::utils::time::to_iso;

/// 服务端错误体：`{"code": "23505", "message": "..."}`
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn error_from_body(status: u16, body: &str) -> RemoteError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .or(parsed.error)
        .unwrap_or_else(|| body.trim().to_string());
    let error = RemoteError::http(status, message);
    match parsed.code {
        Some(code) => error.with_code(code),
        None => error,
    }
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    match error.status() {
        Some(status) => RemoteError::http(status.as_u16(), error.to_string()),
        None => RemoteError::transport(error.to_string()),
    }
}

/// PostgREST 字面量：双引号包裹，内部引号与反斜杠转义
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// 删除过滤条件：单列 `id=in.(...)`，复合键 `or=(and(a.eq.x,b.eq.y),...)`
fn delete_filter(key_columns: &[&str], keys: &[RecordKey]) -> (String, String) {
    if key_columns.len() == 1 {
        let values: Vec<String> = keys
            .iter()
            .filter_map(|key| key.parts().first().map(|v| quote(v)))
            .collect();
        return (key_columns[0].to_string(), format!("in.({})", values.join(",")));
    }
    let clauses: Vec<String> = keys
        .iter()
        .map(|key| {
            let parts: Vec<String> = key_columns
                .iter()
                .zip(key.parts())
                .map(|(column, value)| format!("{}.eq.{}", column, quote(value)))
                .collect();
            format!("and({})", parts.join(","))
        })
        .collect();
    ("or".to_string(), format!("({})", clauses.join(",")))
}

/// keyset 游标之后的主键条件：`or(a.gt.x,and(a.eq.x,b.gt.y))`
fn key_after(key_columns: &[String], key: &RecordKey) -> String {
    let parts = key.parts();
    let clauses: Vec<String> = (0..key_columns.len().min(parts.len()))
        .map(|i| {
            let mut terms: Vec<String> = key_columns[..i]
                .iter()
                .zip(parts)
                .map(|(column, value)| format!("{}.eq.{}", column, quote(value)))
                .collect();
            terms.push(format!("{}.gt.{}", key_columns[i], quote(&parts[i])));
            if terms.len() == 1 {
                terms.remove(0)
            } else {
                format!("and({})", terms.join(","))
            }
        })
        .collect();
    if clauses.len() == 1 {
        clauses[0].clone()
    } else {
        format!("or({})", clauses.join(","))
    }
}

fn select_params(query: &SelectQuery) -> Vec<(String, String)> {
    let mut order = vec!["updated_at.asc.nullslast".to_string()];
    order.extend(query.key_columns.iter().map(|column| format!("{}.asc", column)));
    let mut params = vec![
        ("select".to_string(), "*".to_string()),
        (query.owner_column.clone(), format!("eq.{}", query.user_id)),
        ("order".to_string(), order.join(",")),
        ("limit".to_string(), query.limit.to_string()),
    ];
    match (query.since, &query.after) {
        (Some(since), Some(after)) => {
            let since = quote(&to_iso(since));
            params.push((
                "or".to_string(),
                format!(
                    "(updated_at.gt.{},and(updated_at.eq.{},{}))",
                    since,
                    since,
                    key_after(&query.key_columns, after)
                ),
            ));
        }
        (Some(since), None) => {
            params.push(("updated_at".to_string(), format!("gt.{}", to_iso(since))));
        }
        (None, _) => {}
    }
    params
}

/// 鉴权头共享部分
#[derive(Debug)]
struct Credentials {
    api_key: Option<String>,
    access_token: RwLock<Option<String>>,
}

impl Credentials {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request;
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }
        let bearer = self
            .access_token
            .read()
            .clone()
            .or_else(|| self.api_key.clone());
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        request
    }
}

async fn check(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status.as_u16(), &body))
}

fn build_client(config: &RemoteConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .map_err(|e| CalendarSyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))
}

pub struct HttpRemoteService {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl std::fmt::Debug for HttpRemoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteService")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpRemoteService {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = build_client(config)?;
        info!("HTTP 远端服务已创建 (base_url: {})", config.base_url);
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: Credentials {
                api_key: config.api_key.clone(),
                access_token: RwLock::new(None),
            },
        })
    }

    /// 登录/刷新后更新用户令牌；None 时退回 API key
    pub fn set_access_token(&self, token: Option<String>) {
        *self.credentials.access_token.write() = token;
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn api_url(&self, route: &str, key: Option<&RecordKey>) -> String {
        match key {
            Some(key) => format!("{}/api/{}/{}", self.base_url, route, key),
            None => format!("{}/api/{}", self.base_url, route),
        }
    }
}

#[async_trait]
impl RemoteService for HttpRemoteService {
    async fn upsert(&self, table: &str, key_columns: &[&str], rows: Vec<Row>) -> RemoteResult<Vec<Row>> {
        debug!("upsert {} 行 -> {}", rows.len(), table);
        let request = self
            .client
            .post(self.rest_url(table))
            .query(&[("on_conflict", key_columns.join(","))])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&rows);
        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response).await?;
        let text = response.text().await.map_err(transport_error)?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::transport(format!("解析 upsert 响应失败: {}", e)))
    }

    async fn delete(
        &self,
        table: &str,
        key_columns: &[&str],
        keys: Vec<RecordKey>,
        owner_column: &str,
        user_id: &str,
    ) -> RemoteResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        debug!("delete {} 行 -> {}", keys.len(), table);
        let filter = delete_filter(key_columns, &keys);
        let owner = (owner_column.to_string(), format!("eq.{}", user_id));
        let request = self
            .client
            .delete(self.rest_url(table))
            .query(&[filter, owner]);
        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(transport_error)?;
        check(response).await?;
        Ok(())
    }

    async fn select(&self, table: &str, query: &SelectQuery) -> RemoteResult<Vec<Row>> {
        let request = self
            .client
            .get(self.rest_url(table))
            .query(&select_params(query));
        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response).await?;
        response
            .json::<Vec<Row>>()
            .await
            .map_err(|e| RemoteError::transport(format!("解析 {} 查询结果失败: {}", table, e)))
    }

    async fn composite(
        &self,
        route: &str,
        method: CompositeMethod,
        key: &RecordKey,
        payload: Row,
    ) -> RemoteResult<Value> {
        let request = match method {
            CompositeMethod::Post => self.client.post(self.api_url(route, None)).json(&payload),
            CompositeMethod::Patch => self
                .client
                .patch(self.api_url(route, Some(key)))
                .json(&payload),
            CompositeMethod::Delete => self.client.delete(self.api_url(route, Some(key))),
        };
        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response).await?;
        let text = response.text().await.map_err(transport_error)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::transport(format!("解析 {} 组合响应失败: {}", route, e)))
    }
}

/// 基于 HTTP 长连接的 change feed
pub struct HttpChangeFeed {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpChangeFeed {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        // 长连接不设整体超时
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CalendarSyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: Credentials {
                api_key: config.api_key.clone(),
                access_token: RwLock::new(None),
            },
        })
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.credentials.access_token.write() = token;
    }
}

#[async_trait]
impl ChangeFeedSource for HttpChangeFeed {
    async fn subscribe(&self, user_id: &str) -> RemoteResult<BoxStream<'static, FeedMessage>> {
        let request = self
            .client
            .get(format!("{}/realtime/v1/changes", self.base_url))
            .query(&[("user_id", format!("eq.{}", user_id))])
            .header("Accept", "application/x-ndjson");
        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response).await?;
        info!("change feed 已订阅: user={}", user_id);
        Ok(stream::once(async { FeedMessage::Subscribed })
            .chain(ndjson_messages(response.bytes_stream()))
            .boxed())
    }
}

struct LineState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    finished: bool,
}

/// 按行切分字节流并解析为 [`ChangeEvent`]；空行为心跳，无法解析的行跳过
fn ndjson_messages<S, B, E>(bytes: S) -> BoxStream<'static, FeedMessage>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let state = LineState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ChangeEvent>(line) {
                    Ok(event) => return Some((FeedMessage::Change(event), state)),
                    Err(e) => {
                        warn!("跳过无法解析的 change feed 消息: {}", e);
                        continue;
                    }
                }
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    state.buffer.clear();
                    return Some((
                        FeedMessage::Closed {
                            reason: e.to_string(),
                        },
                        state,
                    ));
                }
                None => {
                    state.finished = true;
                    return Some((
                        FeedMessage::Closed {
                            reason: "stream ended".to_string(),
                        },
                        state,
                    ));
                }
            }
        }
    })
    .boxed()
}
