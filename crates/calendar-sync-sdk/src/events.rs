//! 事件系统模块 - 变更通知总线
//!
//! 功能包括：
//! - 记录变更事件（本地修改 / 远端拉取 / change feed）
//! - outbox 待推送数量变化
//! - 同步状态（待同步数、挂起数、最近错误）
//! - 推送失败通知
//!
//! 存储引擎不感知订阅者：LocalStore 写入成功后发布事件，UI 层按表/来源/主键过滤订阅。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::schema::{RecordKey, Table};
use crate::storage::entities::{OpKind, OutboxCounts};
use crate::storage::queue::PushFailureKind;

/// 变更来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// 本地修改（乐观写入）
    Local,
    /// 增量拉取
    Pull,
    /// 服务端推送的 change feed
    Feed,
    /// 组合端点返回的权威数据
    Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Upserted,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordChange {
    pub key: RecordKey,
    pub kind: ChangeKind,
}

impl RecordChange {
    pub fn upserted(key: RecordKey) -> Self {
        Self {
            key,
            kind: ChangeKind::Upserted,
        }
    }

    pub fn deleted(key: RecordKey) -> Self {
        Self {
            key,
            kind: ChangeKind::Deleted,
        }
    }
}

/// 同步状态（非阻塞的待同步/错误指示）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pending: usize,
    pub parked: usize,
    pub syncing: bool,
    pub last_push_at: Option<DateTime<Utc>>,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn apply_counts(&mut self, counts: &OutboxCounts) {
        self.pending = counts.pending;
        self.parked = counts.parked;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    RecordsChanged {
        table: Table,
        origin: ChangeOrigin,
        changes: Vec<RecordChange>,
        timestamp: u64,
    },
    OutboxChanged {
        user_id: String,
        counts: OutboxCounts,
        timestamp: u64,
    },
    SyncStatusChanged {
        status: SyncStatus,
        timestamp: u64,
    },
    PushFailed {
        table: String,
        op: OpKind,
        kind: PushFailureKind,
        error: String,
        operation_ids: Vec<String>,
        timestamp: u64,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::RecordsChanged { .. } => "records_changed",
            SyncEvent::OutboxChanged { .. } => "outbox_changed",
            SyncEvent::SyncStatusChanged { .. } => "sync_status_changed",
            SyncEvent::PushFailed { .. } => "push_failed",
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            SyncEvent::RecordsChanged { table, .. } => Some(table.as_str()),
            SyncEvent::PushFailed { table, .. } => Some(table),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            SyncEvent::RecordsChanged { timestamp, .. }
            | SyncEvent::OutboxChanged { timestamp, .. }
            | SyncEvent::SyncStatusChanged { timestamp, .. }
            | SyncEvent::PushFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub tables: Option<Vec<Table>>,
    pub origins: Option<Vec<ChangeOrigin>>,
    /// 仅关心这些记录（任一命中即匹配）
    pub keys: Option<Vec<RecordKey>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_tables(mut self, tables: Vec<Table>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn with_origins(mut self, origins: Vec<ChangeOrigin>) -> Self {
        self.origins = Some(origins);
        self
    }

    pub fn with_keys(mut self, keys: Vec<RecordKey>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref tables) = self.tables {
            match event.table() {
                Some(name) if tables.iter().any(|t| t.as_str() == name) => {}
                _ => return false,
            }
        }

        if let Some(ref origins) = self.origins {
            match event {
                SyncEvent::RecordsChanged { origin, .. } if origins.contains(origin) => {}
                _ => return false,
            }
        }

        if let Some(ref keys) = self.keys {
            match event {
                SyncEvent::RecordsChanged { changes, .. }
                    if changes.iter().any(|c| keys.contains(&c.key)) => {}
                _ => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<u64>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 失败属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// `event_type` 为 `"*"` 时接收全部事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器
pub mod event_builders {
    use super::*;

    fn now_millis() -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    pub fn records_changed(
        table: Table,
        origin: ChangeOrigin,
        changes: Vec<RecordChange>,
    ) -> SyncEvent {
        SyncEvent::RecordsChanged {
            table,
            origin,
            changes,
            timestamp: now_millis(),
        }
    }

    pub fn outbox_changed(user_id: &str, counts: OutboxCounts) -> SyncEvent {
        SyncEvent::OutboxChanged {
            user_id: user_id.to_string(),
            counts,
            timestamp: now_millis(),
        }
    }

    pub fn sync_status_changed(status: SyncStatus) -> SyncEvent {
        SyncEvent::SyncStatusChanged {
            status,
            timestamp: now_millis(),
        }
    }

    pub fn push_failed(
        table: &str,
        op: OpKind,
        kind: PushFailureKind,
        error: String,
        operation_ids: Vec<String>,
    ) -> SyncEvent {
        SyncEvent::PushFailed {
            table: table.to_string(),
            op,
            kind,
            error,
            operation_ids,
            timestamp: now_millis(),
        }
    }
}
