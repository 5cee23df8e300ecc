//! 远端服务接口
//!
//! - [`RemoteService`]: 按表 upsert / delete / select，以及聚合资源的组合端点
//! - [`ChangeFeedSource`]: 服务端推送的按用户变更流
//!
//! 实现：[`HttpRemoteService`]（reqwest，PostgREST 风格）与 [`InMemoryRemote`]（测试/演示）。

pub mod http;
pub mod memory;

pub use http::{HttpChangeFeed, HttpRemoteService};
pub use memory::{InMemoryChangeFeed, InMemoryRemote, RemoteCall, RemoteCallKind};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RemoteError;
use crate::schema::RecordKey;
use crate::storage::entities::OpKind;

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

pub type Row = Map<String, Value>;

/// 增量拉取条件：`{owner_column} = user_id`，按 (updated_at, 主键) 升序的 keyset 分页
///
/// - `after` 为空：`updated_at > since`
/// - `after` 非空：`updated_at > since OR (updated_at = since AND key > after)`
///
/// 没有 updated_at 的行排在最后，只在 `since` 为空时返回。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    pub owner_column: String,
    pub key_columns: Vec<String>,
    pub user_id: String,
    pub since: Option<DateTime<Utc>>,
    pub after: Option<RecordKey>,
    pub limit: usize,
}

impl SelectQuery {
    /// 行是否落在游标之后
    pub fn admits(&self, updated_at: Option<DateTime<Utc>>, key: &RecordKey) -> bool {
        match (self.since, updated_at) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(since), Some(updated_at)) => {
                updated_at > since
                    || (updated_at == since && self.after.as_ref().is_some_and(|after| key > after))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeMethod {
    Post,
    Patch,
    Delete,
}

impl CompositeMethod {
    pub fn for_op(op: OpKind) -> Self {
        match op {
            OpKind::Insert => CompositeMethod::Post,
            OpKind::Update => CompositeMethod::Patch,
            OpKind::Delete => CompositeMethod::Delete,
        }
    }
}

#[async_trait]
pub trait RemoteService: Send + Sync {
    /// 批量 upsert，返回服务端写入后的行
    async fn upsert(&self, table: &str, key_columns: &[&str], rows: Vec<Row>) -> RemoteResult<Vec<Row>>;

    /// 批量删除，限定在 `owner_column = user_id` 范围内
    async fn delete(
        &self,
        table: &str,
        key_columns: &[&str],
        keys: Vec<RecordKey>,
        owner_column: &str,
        user_id: &str,
    ) -> RemoteResult<()>;

    async fn select(&self, table: &str, query: &SelectQuery) -> RemoteResult<Vec<Row>>;

    /// 组合端点：一次逻辑写入跨多张服务端表，返回组装后的完整结果
    async fn composite(
        &self,
        route: &str,
        method: CompositeMethod,
        key: &RecordKey,
        payload: Row,
    ) -> RemoteResult<Value>;
}

/// change feed 单条事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(rename = "eventType", alias = "event_type")]
    pub event_type: OpKind,
    #[serde(default)]
    pub old: Option<Row>,
    #[serde(default)]
    pub new: Option<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// 订阅建立（首次或重连后）
    Subscribed,
    Change(ChangeEvent),
    /// 服务端关闭或连接中断
    Closed { reason: String },
}

#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    async fn subscribe(&self, user_id: &str) -> RemoteResult<BoxStream<'static, FeedMessage>>;
}
