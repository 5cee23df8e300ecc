//! 内存远端服务 - 测试与离线演示
//!
//! 行为贴近真实服务端：upsert 按主键合并，删除留下墓碑（`deleted_at`），
//! 组合端点把一次写入拆到多张表并返回组装结果。支持故障注入、延迟与调用记录。

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ChangeEvent, ChangeFeedSource, CompositeMethod, FeedMessage, RemoteResult, RemoteService, Row,
    SelectQuery,
};
use crate::error::RemoteError;
use crate::schema::{key_columns_of, RecordKey, Table};
use crate::storage::entities::{merge_fields, OpKind};
use crate::utils::time::{timestamp_from_json, to_iso, Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCallKind {
    Upsert,
    Delete,
    Select,
    Composite(CompositeMethod),
}

/// 一次远端调用的记录
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub kind: RemoteCallKind,
    pub table: String,
    pub keys: Vec<RecordKey>,
    pub succeeded: bool,
}

#[derive(Debug)]
struct InjectedFailure {
    table: Option<String>,
    error: RemoteError,
    remaining: usize,
}

#[derive(Default)]
struct RemoteState {
    tables: HashMap<String, BTreeMap<RecordKey, Row>>,
    failures: Vec<InjectedFailure>,
    calls: Vec<RemoteCall>,
}

impl RemoteState {
    fn take_failure(&mut self, table: &str) -> Option<RemoteError> {
        let index = self.failures.iter().position(|f| {
            f.remaining > 0 && f.table.as_deref().map_or(true, |t| t == table)
        })?;
        let failure = &mut self.failures[index];
        failure.remaining -= 1;
        let error = failure.error.clone();
        if failure.remaining == 0 {
            self.failures.remove(index);
        }
        Some(error)
    }

    fn record(&mut self, kind: RemoteCallKind, table: &str, keys: Vec<RecordKey>, succeeded: bool) {
        self.calls.push(RemoteCall {
            kind,
            table: table.to_string(),
            keys,
            succeeded,
        });
    }
}

fn is_tombstone(row: &Row) -> bool {
    row.get("deleted_at").map_or(false, |v| !v.is_null())
}

fn owner_of(table: &str, row: &Row) -> Option<String> {
    let column = Table::from_str(table)
        .map(Table::owner_column)
        .unwrap_or("user_id");
    row.get(column).and_then(Value::as_str).map(str::to_string)
}

/// 子表指向聚合根的外键列，例如 events → event_id
fn parent_key_column(root: &str) -> String {
    format!("{}_id", root.trim_end_matches('s'))
}

pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    clock: Arc<dyn Clock>,
    latency: Mutex<Option<Duration>>,
    feed: Option<InMemoryChangeFeed>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryRemote")
            .field("tables", &state.tables.len())
            .field("calls", &state.calls.len())
            .finish()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            clock: Arc::new(SystemClock),
            latency: Mutex::new(None),
            feed: None,
        }
    }

    /// 服务端时钟：写入时缺省的 updated_at、墓碑时间
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 写入成功后向 change feed 广播
    pub fn with_feed(mut self, feed: InMemoryChangeFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// 接下来 `times` 次匹配 `table`（None 为任意表）的调用返回 `error`
    pub fn fail_next(&self, table: Option<&str>, error: RemoteError, times: usize) {
        self.state.lock().failures.push(InjectedFailure {
            table: table.map(str::to_string),
            error,
            remaining: times,
        });
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// 直接写入服务端数据（不记录调用、不广播）
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        let columns = key_columns_of(table);
        let mut state = self.state.lock();
        let stored = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(key) = RecordKey::from_row(columns, &row) {
                stored.insert(key, row);
            }
        }
    }

    /// 未删除的行
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().filter(|r| !is_tombstone(r)).cloned().collect())
            .unwrap_or_default()
    }

    /// 含墓碑
    pub fn row(&self, table: &str, key: &RecordKey) -> Option<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(key).cloned())
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// 成功写入某条记录的次数
    pub fn received(&self, table: &str, key: &RecordKey) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.succeeded && c.kind != RemoteCallKind::Select && c.table == table)
            .map(|c| c.keys.iter().filter(|k| *k == key).count())
            .sum()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn now_iso(&self) -> String {
        to_iso(self.clock.now())
    }

    fn broadcast(&self, events: Vec<(Option<String>, ChangeEvent)>) {
        if let Some(feed) = &self.feed {
            for (owner, event) in events {
                if let Some(owner) = owner {
                    feed.publish(&owner, event);
                }
            }
        }
    }

    /// 合并写入一行；返回写入后的行与之前的行
    fn store_row(state: &mut RemoteState, table: &str, key: RecordKey, row: &Row, now: &str) -> (Row, Option<Row>) {
        let stored = state.tables.entry(table.to_string()).or_default();
        let previous = stored.get(&key).cloned();
        let mut merged = match &previous {
            Some(existing) if !is_tombstone(existing) => existing.clone(),
            _ => Row::new(),
        };
        merge_fields(&mut merged, row);
        merged.remove("deleted_at");
        if !row.contains_key("updated_at") {
            merged.insert("updated_at".to_string(), Value::String(now.to_string()));
        }
        stored.insert(key, merged.clone());
        (merged, previous)
    }

    fn tombstone(state: &mut RemoteState, table: &str, key: &RecordKey, now: &str) -> Option<Row> {
        let row = state.tables.get_mut(table)?.get_mut(key)?;
        if is_tombstone(row) {
            return None;
        }
        let old = row.clone();
        row.insert("deleted_at".to_string(), Value::String(now.to_string()));
        row.insert("updated_at".to_string(), Value::String(now.to_string()));
        Some(old)
    }
}

#[async_trait]
impl RemoteService for InMemoryRemote {
    async fn upsert(&self, table: &str, key_columns: &[&str], rows: Vec<Row>) -> RemoteResult<Vec<Row>> {
        self.simulate_latency().await;
        let now = self.now_iso();
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            match RecordKey::from_row(key_columns, row) {
                Some(key) => keys.push(key),
                None => {
                    return Err(RemoteError::http(400, format!("{} 行缺少主键 {:?}", table, key_columns))
                        .with_code("PGRST102"))
                }
            }
        }

        let (written, events) = {
            let mut state = self.state.lock();
            if let Some(error) = state.take_failure(table) {
                state.record(RemoteCallKind::Upsert, table, keys, false);
                return Err(error);
            }
            let mut written = Vec::with_capacity(rows.len());
            let mut events = Vec::with_capacity(rows.len());
            for (key, row) in keys.iter().zip(rows.iter()) {
                let (stored, previous) = Self::store_row(&mut state, table, key.clone(), row, &now);
                let event_type = match &previous {
                    Some(p) if !is_tombstone(p) => OpKind::Update,
                    _ => OpKind::Insert,
                };
                events.push((
                    owner_of(table, &stored),
                    ChangeEvent {
                        table: table.to_string(),
                        event_type,
                        old: previous,
                        new: Some(stored.clone()),
                    },
                ));
                written.push(stored);
            }
            state.record(RemoteCallKind::Upsert, table, keys, true);
            (written, events)
        };
        debug!("内存远端 upsert {} 行 -> {}", written.len(), table);
        self.broadcast(events);
        Ok(written)
    }

    async fn delete(
        &self,
        table: &str,
        _key_columns: &[&str],
        keys: Vec<RecordKey>,
        owner_column: &str,
        user_id: &str,
    ) -> RemoteResult<()> {
        self.simulate_latency().await;
        let now = self.now_iso();
        let events = {
            let mut state = self.state.lock();
            if let Some(error) = state.take_failure(table) {
                state.record(RemoteCallKind::Delete, table, keys, false);
                return Err(error);
            }
            let mut events = Vec::new();
            for key in &keys {
                let owned = state
                    .tables
                    .get(table)
                    .and_then(|rows| rows.get(key))
                    .map_or(false, |row| {
                        row.get(owner_column).and_then(Value::as_str) == Some(user_id)
                    });
                if !owned {
                    continue;
                }
                if let Some(old) = Self::tombstone(&mut state, table, key, &now) {
                    events.push((
                        Some(user_id.to_string()),
                        ChangeEvent {
                            table: table.to_string(),
                            event_type: OpKind::Delete,
                            old: Some(old),
                            new: None,
                        },
                    ));
                }
            }
            state.record(RemoteCallKind::Delete, table, keys, true);
            events
        };
        self.broadcast(events);
        Ok(())
    }

    async fn select(&self, table: &str, query: &SelectQuery) -> RemoteResult<Vec<Row>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if let Some(error) = state.take_failure(table) {
            state.record(RemoteCallKind::Select, table, Vec::new(), false);
            return Err(error);
        }
        let mut matched: Vec<(Option<chrono::DateTime<chrono::Utc>>, RecordKey, Row)> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, row)| {
                        row.get(&query.owner_column).and_then(Value::as_str)
                            == Some(query.user_id.as_str())
                    })
                    .map(|(key, row)| {
                        let updated_at = row.get("updated_at").and_then(timestamp_from_json);
                        (updated_at, key.clone(), row.clone())
                    })
                    .filter(|(updated_at, key, _)| query.admits(*updated_at, key))
                    .collect()
            })
            .unwrap_or_default();
        // updated_at 为空的行排在最后（nullslast）
        matched.sort_by(|a, b| (a.0.is_none(), a.0, &a.1).cmp(&(b.0.is_none(), b.0, &b.1)));
        let page: Vec<Row> = matched
            .into_iter()
            .take(query.limit)
            .map(|(_, _, row)| row)
            .collect();
        state.record(RemoteCallKind::Select, table, Vec::new(), true);
        Ok(page)
    }

    async fn composite(
        &self,
        route: &str,
        method: CompositeMethod,
        key: &RecordKey,
        payload: Row,
    ) -> RemoteResult<Value> {
        self.simulate_latency().await;
        let now = self.now_iso();
        let root = route.to_string();
        let kind = RemoteCallKind::Composite(method);

        let (response, events) = {
            let mut state = self.state.lock();
            if let Some(error) = state.take_failure(&root) {
                state.record(kind, &root, vec![key.clone()], false);
                return Err(error);
            }
            let existing = state
                .tables
                .get(&root)
                .and_then(|rows| rows.get(key))
                .filter(|row| !is_tombstone(row))
                .cloned();
            let fk_column = parent_key_column(&root);

            match method {
                CompositeMethod::Delete => {
                    let mut events = Vec::new();
                    let owner = existing.as_ref().and_then(|row| owner_of(&root, row));
                    if let Some(old) = Self::tombstone(&mut state, &root, key, &now) {
                        events.push((
                            owner.clone(),
                            ChangeEvent {
                                table: root.clone(),
                                event_type: OpKind::Delete,
                                old: Some(old),
                                new: None,
                            },
                        ));
                    }
                    let root_id = key.parts().first().cloned().unwrap_or_default();
                    let children: Vec<(String, RecordKey)> = state
                        .tables
                        .iter()
                        .filter(|(name, _)| **name != root)
                        .flat_map(|(name, rows)| {
                            rows.iter()
                                .filter(|(_, row)| {
                                    row.get(&fk_column).and_then(Value::as_str)
                                        == Some(root_id.as_str())
                                })
                                .map(|(k, _)| (name.clone(), k.clone()))
                                .collect::<Vec<_>>()
                        })
                        .collect();
                    for (table, child_key) in children {
                        if let Some(old) = Self::tombstone(&mut state, &table, &child_key, &now) {
                            events.push((
                                owner.clone(),
                                ChangeEvent {
                                    table,
                                    event_type: OpKind::Delete,
                                    old: Some(old),
                                    new: None,
                                },
                            ));
                        }
                    }
                    state.record(kind, &root, vec![key.clone()], true);
                    (Value::Null, events)
                }
                CompositeMethod::Post | CompositeMethod::Patch => {
                    if method == CompositeMethod::Post && existing.is_some() {
                        state.record(kind, &root, vec![key.clone()], false);
                        return Err(RemoteError::http(409, format!("{} {} 已存在", root, key))
                            .with_code("23505"));
                    }
                    if method == CompositeMethod::Patch && existing.is_none() {
                        state.record(kind, &root, vec![key.clone()], false);
                        return Err(RemoteError::http(404, format!("{} {} 不存在", root, key)));
                    }

                    let mut root_row = Row::new();
                    let mut child_rows: Vec<(String, Row)> = Vec::new();
                    for (field, value) in payload {
                        let nested_table = Table::from_str(&field).is_ok() && field != root;
                        match value {
                            Value::Object(row) if nested_table => child_rows.push((field, row)),
                            Value::Array(items) if nested_table => child_rows.extend(
                                items.into_iter().filter_map(|item| match item {
                                    Value::Object(row) => Some((field.clone(), row)),
                                    _ => None,
                                }),
                            ),
                            other => {
                                root_row.insert(field, other);
                            }
                        }
                    }

                    let (stored_root, previous) =
                        Self::store_row(&mut state, &root, key.clone(), &root_row, &now);
                    let owner = owner_of(&root, &stored_root);
                    let mut events = vec![(
                        owner.clone(),
                        ChangeEvent {
                            table: root.clone(),
                            event_type: if previous.is_some() { OpKind::Update } else { OpKind::Insert },
                            old: previous,
                            new: Some(stored_root.clone()),
                        },
                    )];
                    let mut response = Row::new();
                    response.insert(root.clone(), Value::Array(vec![Value::Object(stored_root.clone())]));

                    for (table, mut row) in child_rows {
                        if let Some(root_id) = key.parts().first() {
                            row.entry(fk_column.clone())
                                .or_insert_with(|| Value::String(root_id.clone()));
                        }
                        if let Some(user) = stored_root.get("user_id") {
                            row.entry("user_id".to_string()).or_insert_with(|| user.clone());
                        }
                        let Some(child_key) = RecordKey::from_row(key_columns_of(&table), &row) else {
                            continue;
                        };
                        let (stored, previous) = Self::store_row(&mut state, &table, child_key, &row, &now);
                        events.push((
                            owner.clone(),
                            ChangeEvent {
                                table: table.clone(),
                                event_type: if previous.is_some() { OpKind::Update } else { OpKind::Insert },
                                old: previous,
                                new: Some(stored.clone()),
                            },
                        ));
                        if let Value::Array(items) = response
                            .entry(table)
                            .or_insert_with(|| Value::Array(Vec::new()))
                        {
                            items.push(Value::Object(stored));
                        }
                    }
                    state.record(kind, &root, vec![key.clone()], true);
                    (Value::Object(response), events)
                }
            }
        };
        self.broadcast(events);
        Ok(response)
    }
}

#[derive(Default)]
struct FeedState {
    subscribers: Vec<(String, mpsc::UnboundedSender<FeedMessage>)>,
    failures: Vec<RemoteError>,
    subscriptions: usize,
}

/// 内存 change feed：按用户分发，可手动断开或让订阅失败
#[derive(Clone, Default)]
pub struct InMemoryChangeFeed {
    inner: Arc<Mutex<FeedState>>,
}

impl std::fmt::Debug for InMemoryChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, user_id: &str, event: ChangeEvent) {
        let mut state = self.inner.lock();
        state.subscribers.retain(|(user, sender)| {
            if user != user_id {
                return !sender.is_closed();
            }
            sender.send(FeedMessage::Change(event.clone())).is_ok()
        });
    }

    /// 断开所有订阅（订阅方收到 Closed 后流结束）
    pub fn disconnect_all(&self, reason: &str) {
        let subscribers = std::mem::take(&mut self.inner.lock().subscribers);
        for (_, sender) in subscribers {
            let _ = sender.send(FeedMessage::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// 接下来的一次订阅返回 `error`
    pub fn fail_next_subscribe(&self, error: RemoteError) {
        self.inner.lock().failures.push(error);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .subscribers
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .count()
    }

    /// 累计成功订阅次数（含重连）
    pub fn subscriptions(&self) -> usize {
        self.inner.lock().subscriptions
    }
}

#[async_trait]
impl ChangeFeedSource for InMemoryChangeFeed {
    async fn subscribe(&self, user_id: &str) -> RemoteResult<BoxStream<'static, FeedMessage>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.lock();
            if !state.failures.is_empty() {
                return Err(state.failures.remove(0));
            }
            let _ = sender.send(FeedMessage::Subscribed);
            state.subscribers.push((user_id.to_string(), sender));
            state.subscriptions += 1;
        }
        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|message| (message, receiver))
        })
        .boxed())
    }
}
