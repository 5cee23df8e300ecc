//! CalendarSync 会话入口
//!
//! 分层：
//! ```text
//! CalendarSync (会话：登录即打开，登出即销毁)
//!   ├── LocalStore        本地库 + outbox + 水位
//!   ├── SyncOrchestrator  push / pull
//!   ├── SyncScheduler     触发源汇总
//!   ├── ChangeFeedBridge  服务端推送
//!   └── LifecycleManager  前后台切换
//! ```
//!
//! 修改入口（insert / update / delete / apply_batch）先校验，再在同一事务中乐观写本地库并入队，
//! 最后通知调度器。远端失败不会让修改失败，只体现在 [`SyncStatus`] 与 outbox 上。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CalendarSyncConfig;
use crate::error::{CalendarSyncError, Result};
use crate::events::{EventFilter, FilteredEventReceiver, SyncEvent, SyncStatus};
use crate::lifecycle::{LifecycleManager, SyncLifecycleHook};
use crate::network::NetworkMonitor;
use crate::remote::{ChangeFeedSource, HttpChangeFeed, HttpRemoteService, RemoteService};
use crate::schema::{RecordKey, Table};
use crate::storage::{
    merge_fields, ApplyReport, IndexQuery, LocalStore, OpKind, OutboxOperation, OutboxQueue,
    PreparedMutation, Record,
};
use crate::sync::{ChangeFeedBridge, PullSummary, PushReport, SyncOrchestrator, SyncScheduler, SyncTrigger};
use crate::utils::time::{to_iso, Clock, IdGenerator, SystemClock, UuidGenerator};

pub type Row = Map<String, Value>;

/// 入队前的校验钩子：返回（可能改写过的）行，或拒绝原因
pub trait RecordValidator: Send + Sync {
    fn validate(&self, table: Table, row: Row) -> std::result::Result<Row, String>;
}

impl<F> RecordValidator for F
where
    F: Fn(Table, Row) -> std::result::Result<Row, String> + Send + Sync,
{
    fn validate(&self, table: Table, row: Row) -> std::result::Result<Row, String> {
        self(table, row)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl RecordValidator for AcceptAll {
    fn validate(&self, _table: Table, row: Row) -> std::result::Result<Row, String> {
        Ok(row)
    }
}

/// 一次本地修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Insert { table: Table, row: Row },
    /// 字段补丁；主键列不可修改，会被忽略
    Update { table: Table, key: RecordKey, patch: Row },
    Delete { table: Table, key: RecordKey },
}

/// 会话之间共享的协作者（切换用户时沿用）
#[derive(Clone)]
struct SessionParts {
    remote: Arc<dyn RemoteService>,
    feed: Option<Arc<dyn ChangeFeedSource>>,
    http: Option<(Arc<HttpRemoteService>, Arc<HttpChangeFeed>)>,
    validator: Arc<dyn RecordValidator>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    network: Arc<NetworkMonitor>,
}

pub struct CalendarSyncBuilder {
    config: CalendarSyncConfig,
    remote: Option<Arc<dyn RemoteService>>,
    feed: Option<Arc<dyn ChangeFeedSource>>,
    validator: Option<Arc<dyn RecordValidator>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    network: Option<Arc<NetworkMonitor>>,
    access_token: Option<String>,
}

impl CalendarSyncBuilder {
    /// 自定义远端；不设置时使用 HTTP 远端与 HTTP change feed
    pub fn remote(mut self, remote: Arc<dyn RemoteService>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn change_feed(mut self, feed: Arc<dyn ChangeFeedSource>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn RecordValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<NetworkMonitor>) -> Self {
        self.network = Some(monitor);
        self
    }

    /// HTTP 远端的登录凭据
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn into_parts(self) -> Result<(CalendarSyncConfig, SessionParts)> {
        self.config.validate()?;
        let (remote, feed, http) = match self.remote {
            Some(remote) => (remote, self.feed, None),
            None => {
                let service = Arc::new(HttpRemoteService::new(&self.config.remote)?);
                let feed = Arc::new(HttpChangeFeed::new(&self.config.remote)?);
                service.set_access_token(self.access_token.clone());
                feed.set_access_token(self.access_token.clone());
                let source: Arc<dyn ChangeFeedSource> = match self.feed {
                    Some(custom) => custom,
                    None => feed.clone() as Arc<dyn ChangeFeedSource>,
                };
                (
                    service.clone() as Arc<dyn RemoteService>,
                    Some(source),
                    Some((service, feed)),
                )
            }
        };
        let parts = SessionParts {
            remote,
            feed,
            http,
            validator: self.validator.unwrap_or_else(|| Arc::new(AcceptAll)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            ids: self.ids.unwrap_or_else(|| Arc::new(UuidGenerator)),
            network: self
                .network
                .unwrap_or_else(|| Arc::new(NetworkMonitor::manual())),
        };
        Ok((self.config, parts))
    }

    /// 登录：打开该用户的本地库并（按配置）启动同步
    pub async fn open(self, user_id: &str) -> Result<CalendarSync> {
        let (config, parts) = self.into_parts()?;
        CalendarSync::open_with(config, parts, user_id).await
    }
}

/// 单个用户的同步会话
pub struct CalendarSync {
    config: CalendarSyncConfig,
    parts: SessionParts,
    user_id: String,
    store: LocalStore,
    orchestrator: Arc<SyncOrchestrator>,
    scheduler: Arc<SyncScheduler>,
    lifecycle: RwLock<LifecycleManager>,
    feed_cancel: CancellationToken,
    feed_task: parking_lot::Mutex<Option<JoinHandle<Result<()>>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CalendarSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalendarSync")
            .field("user_id", &self.user_id)
            .field("store", &self.store)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl CalendarSync {
    pub fn builder(config: CalendarSyncConfig) -> CalendarSyncBuilder {
        CalendarSyncBuilder {
            config,
            remote: None,
            feed: None,
            validator: None,
            clock: None,
            ids: None,
            network: None,
            access_token: None,
        }
    }

    async fn open_with(config: CalendarSyncConfig, parts: SessionParts, user_id: &str) -> Result<Self> {
        if user_id.is_empty() {
            return Err(CalendarSyncError::InvalidArgument("user_id 不能为空".to_string()));
        }
        info!("打开会话: user={}", user_id);
        tokio::fs::create_dir_all(config.user_dir(user_id)).await?;
        let store = LocalStore::builder(config.store_path(user_id))
            .clock(parts.clock.clone())
            .id_generator(parts.ids.clone())
            .event_capacity(config.event_config.capacity)
            .open()
            .await?;

        let orchestrator = Arc::new(SyncOrchestrator::new(store.clone(), parts.remote.clone(), &config));
        let scheduler = Arc::new(SyncScheduler::new(
            orchestrator.clone(),
            user_id,
            config.scheduler_config.clone(),
        ));
        scheduler.watch_network(&parts.network);
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(SyncLifecycleHook::new(scheduler.clone())));

        let session = Self {
            user_id: user_id.to_string(),
            store,
            orchestrator,
            scheduler,
            lifecycle: RwLock::new(lifecycle),
            feed_cancel: CancellationToken::new(),
            feed_task: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
            parts,
        };
        if session.config.scheduler_config.auto_start {
            session.start_sync();
        }
        Ok(session)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &CalendarSyncConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.parts.network
    }

    /// 启动调度器与 change feed；重复调用无效果
    pub fn start_sync(&self) {
        self.scheduler.start();
        let Some(source) = self.parts.feed.clone() else {
            return;
        };
        let mut task = self.feed_task.lock();
        if task.is_some() {
            return;
        }
        let bridge = Arc::new(ChangeFeedBridge::new(
            source,
            self.orchestrator.clone(),
            Duration::from_millis(self.config.scheduler_config.feed_reconnect_delay_ms),
        ));
        *task = Some(bridge.spawn(self.user_id.clone(), self.feed_cancel.clone()));
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CalendarSyncError::ShuttingDown("会话已关闭".to_string()));
        }
        Ok(())
    }

    // ========== 修改入口 ==========

    pub async fn insert(&self, table: Table, row: Row) -> Result<Record> {
        self.apply_batch(vec![Mutation::Insert { table, row }])
            .await?
            .pop()
            .flatten()
            .ok_or_else(|| CalendarSyncError::Database(format!("{} insert 未返回记录", table)))
    }

    /// 记录须已存在于本地库
    pub async fn update(&self, table: Table, key: &RecordKey, patch: Row) -> Result<Record> {
        self.apply_batch(vec![Mutation::Update {
            table,
            key: key.clone(),
            patch,
        }])
        .await?
        .pop()
        .flatten()
        .ok_or_else(|| CalendarSyncError::Database(format!("{} update 未返回记录", table)))
    }

    pub async fn delete(&self, table: Table, key: &RecordKey) -> Result<()> {
        self.apply_batch(vec![Mutation::Delete {
            table,
            key: key.clone(),
        }])
        .await?;
        Ok(())
    }

    /// 全部成功或全部不写入
    pub async fn apply_batch(&self, mutations: Vec<Mutation>) -> Result<Vec<Option<Record>>> {
        self.ensure_open()?;
        let prepared = self.prepare(mutations).await?;
        let result = self.store.apply_mutations(&self.user_id, prepared).await?;
        self.scheduler.notify_outbox_changed();
        Ok(result.records)
    }

    async fn prepare(&self, mutations: Vec<Mutation>) -> Result<Vec<PreparedMutation>> {
        let now = self.parts.clock.now();
        // 同一批次中前面的修改对后面的 update 可见
        let mut staged: HashMap<(Table, RecordKey), Option<Row>> = HashMap::new();
        let mut prepared = Vec::with_capacity(mutations.len());

        for mutation in mutations {
            let op_id = self.parts.ids.next_id();
            let mutation = match mutation {
                Mutation::Insert { table, row } => {
                    let row = self.validate(table, self.complete_insert(table, row, now))?;
                    let key = table.key_of(&row).map_err(|e| CalendarSyncError::Validation {
                        table: table.to_string(),
                        reason: e.to_string(),
                    })?;
                    staged.insert((table, key.clone()), Some(row.clone()));
                    PreparedMutation {
                        table,
                        key,
                        op: OpKind::Insert,
                        row: Some(row.clone()),
                        outbox_payload: row,
                        op_id,
                        now,
                    }
                }
                Mutation::Update {
                    table,
                    key,
                    mut patch,
                } => {
                    let current = match staged.get(&(table, key.clone())) {
                        Some(Some(row)) => row.clone(),
                        Some(None) => return Err(not_found(table, &key)),
                        None => match self.store.get(table, &key).await? {
                            Some(record) => record.data,
                            None => return Err(not_found(table, &key)),
                        },
                    };
                    for column in table.key_columns() {
                        patch.remove(*column);
                    }
                    patch.insert("updated_at".to_string(), Value::String(to_iso(now)));
                    let mut merged = current;
                    merge_fields(&mut merged, &patch);
                    let validated = self.validate(table, merged)?;
                    let patch: Row = patch
                        .keys()
                        .filter_map(|field| {
                            validated.get(field).map(|value| (field.clone(), value.clone()))
                        })
                        .collect();
                    staged.insert((table, key.clone()), Some(validated));

                    let mut payload = table.key_fields(&key);
                    payload.extend(patch.clone());
                    PreparedMutation {
                        table,
                        key,
                        op: OpKind::Update,
                        row: Some(patch),
                        outbox_payload: payload,
                        op_id,
                        now,
                    }
                }
                Mutation::Delete { table, key } => {
                    staged.insert((table, key.clone()), None);
                    PreparedMutation {
                        table,
                        outbox_payload: table.key_fields(&key),
                        key,
                        op: OpKind::Delete,
                        row: None,
                        op_id,
                        now,
                    }
                }
            };
            prepared.push(mutation);
        }
        Ok(prepared)
    }

    /// 补全 insert：单列 id 缺失时生成，归属列与时间戳由会话填写
    fn complete_insert(&self, table: Table, mut row: Row, now: chrono::DateTime<chrono::Utc>) -> Row {
        if table == Table::Profile {
            row.entry("id".to_string())
                .or_insert_with(|| Value::String(self.user_id.clone()));
        } else {
            if let [column] = table.key_columns() {
                row.entry(column.to_string())
                    .or_insert_with(|| Value::String(self.parts.ids.next_id()));
            }
            row.entry(table.owner_column().to_string())
                .or_insert_with(|| Value::String(self.user_id.clone()));
        }
        let now = Value::String(to_iso(now));
        row.entry("created_at".to_string()).or_insert_with(|| now.clone());
        row.insert("updated_at".to_string(), now);
        row
    }

    fn validate(&self, table: Table, row: Row) -> Result<Row> {
        self.parts.validator.validate(table, row).map_err(|reason| {
            debug!("校验失败: table={}, reason={}", table, reason);
            CalendarSyncError::Validation {
                table: table.to_string(),
                reason,
            }
        })
    }

    // ========== 读取 ==========

    pub async fn get(&self, table: Table, key: &RecordKey) -> Result<Option<Record>> {
        self.store.get(table, key).await
    }

    pub async fn query(&self, table: Table, query: IndexQuery) -> Result<Vec<Record>> {
        self.store.query(table, query).await
    }

    pub async fn list(&self, table: Table) -> Result<Vec<Record>> {
        self.store.list(table).await
    }

    pub fn outbox(&self) -> OutboxQueue {
        self.store.outbox()
    }

    pub async fn pending_operations(&self) -> Result<Vec<OutboxOperation>> {
        self.store.outbox().list(&self.user_id).await
    }

    // ========== 同步控制 ==========

    /// 立即 push + 全表 pull（不经过调度器）
    pub async fn sync_now(&self) -> Result<(PushReport, PullSummary)> {
        self.ensure_open()?;
        self.orchestrator.sync(&self.user_id).await
    }

    pub async fn push_now(&self) -> Result<PushReport> {
        self.ensure_open()?;
        self.orchestrator.push(&self.user_id).await
    }

    pub async fn pull_now(&self) -> Result<PullSummary> {
        self.ensure_open()?;
        self.orchestrator.pull_all(&self.user_id).await
    }

    pub async fn pull_table(&self, table: Table) -> Result<ApplyReport> {
        self.ensure_open()?;
        self.orchestrator.pull(table, &self.user_id).await
    }

    /// 交给调度器执行一次完整同步
    pub fn request_sync(&self) {
        self.scheduler.trigger(SyncTrigger::Manual);
    }

    /// 重新登录等外部干预之后，恢复挂起的操作
    pub async fn retry_parked(&self) -> Result<usize> {
        self.ensure_open()?;
        let resumed = self.store.outbox().retry_parked(&self.user_id).await?;
        if resumed > 0 {
            self.scheduler.notify_outbox_changed();
        }
        Ok(resumed)
    }

    /// 更新 HTTP 远端的访问令牌；自定义远端时无效果
    pub fn set_access_token(&self, token: Option<String>) {
        if let Some((service, feed)) = &self.parts.http {
            service.set_access_token(token.clone());
            feed.set_access_token(token);
        }
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let counts = self.store.outbox().counts(&self.user_id).await?;
        let mut status = self.orchestrator.status();
        status.apply_counts(&counts);
        Ok(status)
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.store.events().subscribe()
    }

    pub fn subscribe(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.store.events().subscribe_filtered(filter)
    }

    // ========== 生命周期 ==========

    pub async fn enter_foreground(&self) -> Result<()> {
        self.ensure_open()?;
        self.lifecycle.read().await.notify_foreground().await
    }

    pub async fn enter_background(&self) -> Result<()> {
        self.ensure_open()?;
        self.lifecycle.read().await.notify_background().await
    }

    /// 停止调度器与 change feed 并关闭本地库，不删除数据
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.scheduler.stop().await;
        self.feed_cancel.cancel();
        let feed_task = self.feed_task.lock().take();
        if let Some(task) = feed_task {
            match task.await {
                Ok(Err(e)) => warn!("change feed 以错误结束: {}", e),
                Err(e) => warn!("change feed 任务异常: {}", e),
                Ok(Ok(())) => {}
            }
        }
        self.store.close().await?;
        info!("会话已关闭: user={}", self.user_id);
        Ok(())
    }

    /// 登出：关闭会话，按配置删除该用户的本地数据
    pub async fn logout(&self) -> Result<()> {
        self.close().await?;
        if self.config.clear_on_logout {
            let dir = self.config.user_dir(&self.user_id);
            if tokio::fs::try_exists(&dir).await? {
                tokio::fs::remove_dir_all(&dir).await?;
                info!("已清除本地数据: {}", dir.display());
            }
        }
        Ok(())
    }

    /// 切换用户 = 登出当前用户 + 打开新用户
    pub async fn switch_user(self, user_id: &str) -> Result<CalendarSync> {
        info!("切换用户: {} -> {}", self.user_id, user_id);
        self.logout().await?;
        Self::open_with(self.config.clone(), self.parts.clone(), user_id).await
    }
}

impl Drop for CalendarSync {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.scheduler.cancel_token().cancel();
            self.feed_cancel.cancel();
        }
    }
}

fn not_found(table: Table, key: &RecordKey) -> CalendarSyncError {
    CalendarSyncError::NotFound(format!("{} {}", table, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::error::RemoteError;
    use crate::remote::{InMemoryChangeFeed, InMemoryRemote, RemoteCallKind};
    use crate::utils::time::{ManualClock, SequentialIds};
    use serde_json::json;

    const USER: &str = "u1";

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    struct Harness {
        dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        remote: Arc<InMemoryRemote>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::at_millis(1_770_000_000_000));
            Self {
                dir: tempfile::tempdir().unwrap(),
                remote: Arc::new(InMemoryRemote::new().with_clock(clock.clone())),
                clock,
            }
        }

        fn config(&self, auto_start: bool) -> CalendarSyncConfig {
            CalendarSyncConfig::builder()
                .data_dir(self.dir.path())
                .scheduler_config(SchedulerConfig {
                    auto_start,
                    pull_interval_secs: 0,
                    push_debounce_ms: 0,
                    feed_reconnect_delay_ms: 10,
                })
                .build()
                .unwrap()
        }

        fn builder(&self, auto_start: bool) -> CalendarSyncBuilder {
            CalendarSync::builder(self.config(auto_start))
                .remote(self.remote.clone())
                .clock(self.clock.clone())
                .id_generator(Arc::new(SequentialIds::new("id")))
        }

        async fn open(&self) -> CalendarSync {
            self.builder(false).open(USER).await.unwrap()
        }
    }

    #[tokio::test]
    async fn insert_fills_key_owner_and_timestamps() {
        let h = Harness::new();
        let session = h.open().await;
        let record = session
            .insert(Table::Calendar, row(json!({"name": "Work"})))
            .await
            .unwrap();
        assert!(record.get_str("id").is_some());
        assert_eq!(record.get_str("user_id"), Some(USER));
        assert!(record.get_str("created_at").is_some());
        assert_eq!(record.updated_at, Some(h.clock.now()));

        let profile = session.insert(Table::Profile, Map::new()).await.unwrap();
        assert_eq!(profile.key, RecordKey::single(USER));
        assert_eq!(session.pending_operations().await.unwrap().len(), 2);
    }

    /// 新建后两次修改标题：outbox 只有一条 insert，push 后清空，pull 后水位越过该记录
    #[tokio::test]
    async fn insert_then_updates_collapse_into_one_insert() {
        let h = Harness::new();
        let session = h.open().await;
        let record = session
            .insert(Table::Calendar, row(json!({"name": "draft"})))
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        session
            .update(Table::Calendar, &record.key, row(json!({"name": "second"})))
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        let latest = session
            .update(Table::Calendar, &record.key, row(json!({"name": "final"})))
            .await
            .unwrap();

        let pending = session.pending_operations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, OpKind::Insert);
        assert_eq!(pending[0].payload["name"], json!("final"));

        let (pushed, _) = session.sync_now().await.unwrap();
        assert_eq!(pushed.acknowledged, 1);
        assert!(session.pending_operations().await.unwrap().is_empty());
        let watermark = session
            .store()
            .watermarks()
            .get(Table::Calendar, USER)
            .await
            .unwrap()
            .unwrap();
        assert!(watermark >= latest.updated_at.unwrap());
        assert_eq!(h.remote.rows("calendars")[0]["name"], json!("final"));
    }

    #[tokio::test]
    async fn delete_before_sync_sends_nothing() {
        let h = Harness::new();
        let session = h.open().await;
        let record = session
            .insert(Table::Persona, row(json!({"name": "B"})))
            .await
            .unwrap();
        session.delete(Table::Persona, &record.key).await.unwrap();
        assert!(session.pending_operations().await.unwrap().is_empty());
        assert!(session.get(Table::Persona, &record.key).await.unwrap().is_none());

        session.push_now().await.unwrap();
        assert!(h
            .remote
            .calls()
            .iter()
            .all(|call| call.kind == RemoteCallKind::Select));
    }

    #[tokio::test]
    async fn validation_failure_writes_nothing() {
        let h = Harness::new();
        let validator = |table: Table, row: Row| {
            if table == Table::Calendar && row.get("name").and_then(Value::as_str) == Some("") {
                return Err("name 不能为空".to_string());
            }
            Ok(row)
        };
        let session = h
            .builder(false)
            .validator(Arc::new(validator))
            .open(USER)
            .await
            .unwrap();

        let error = session
            .insert(Table::Calendar, row(json!({"id": "c1", "name": ""})))
            .await
            .unwrap_err();
        assert!(matches!(error, CalendarSyncError::Validation { .. }));
        assert!(session.list(Table::Calendar).await.unwrap().is_empty());
        assert!(session.pending_operations().await.unwrap().is_empty());

        session
            .insert(Table::Calendar, row(json!({"id": "c1", "name": "ok"})))
            .await
            .unwrap();
        let error = session
            .update(Table::Calendar, &"c1".into(), row(json!({"name": ""})))
            .await
            .unwrap_err();
        assert!(matches!(error, CalendarSyncError::Validation { .. }));
        let local = session.get(Table::Calendar, &"c1".into()).await.unwrap().unwrap();
        assert_eq!(local.get_str("name"), Some("ok"));
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let h = Harness::new();
        let session = h.open().await;
        let error = session
            .update(Table::Event, &"missing".into(), row(json!({"title": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(error, CalendarSyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let h = Harness::new();
        let session = h.open().await;
        let result = session
            .apply_batch(vec![
                Mutation::Insert {
                    table: Table::Calendar,
                    row: row(json!({"id": "c1"})),
                },
                Mutation::Update {
                    table: Table::Category,
                    key: "nope".into(),
                    patch: row(json!({"name": "x"})),
                },
            ])
            .await;
        assert!(result.is_err());
        assert!(session.list(Table::Calendar).await.unwrap().is_empty());

        // 批次内先 insert 再 update：合并为一条 insert
        let records = session
            .apply_batch(vec![
                Mutation::Insert {
                    table: Table::Event,
                    row: row(json!({"id": "e1", "title": "a"})),
                },
                Mutation::Update {
                    table: Table::Event,
                    key: "e1".into(),
                    patch: row(json!({"title": "b", "id": "ignored"})),
                },
            ])
            .await
            .unwrap();
        assert_eq!(records[1].as_ref().unwrap().get_str("title"), Some("b"));
        assert_eq!(records[1].as_ref().unwrap().key, RecordKey::single("e1"));
        let pending = session.pending_operations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, OpKind::Insert);
        assert_eq!(pending[0].payload["title"], json!("b"));
    }

    #[tokio::test]
    async fn parked_operations_resume_after_intervention() {
        let h = Harness::new();
        let session = h.open().await;
        h.remote
            .fail_next(Some("categories"), RemoteError::http(401, "jwt expired"), 1);
        session
            .insert(Table::Category, row(json!({"id": "k1"})))
            .await
            .unwrap();

        let report = session.push_now().await.unwrap();
        assert_eq!(report.parked, 1);
        let status = session.status().await.unwrap();
        assert_eq!(status.parked, 1);
        assert_eq!(status.pending, 0);
        assert!(status.last_error.is_some());

        // 不会自动重试
        session.push_now().await.unwrap();
        assert!(h.remote.rows("categories").is_empty());

        assert_eq!(session.retry_parked().await.unwrap(), 1);
        let report = session.push_now().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(h.remote.rows("categories").len(), 1);
    }

    #[tokio::test]
    async fn logout_clears_user_data_and_switch_starts_fresh() {
        let h = Harness::new();
        let session = h.open().await;
        session
            .insert(Table::Calendar, row(json!({"id": "c1"})))
            .await
            .unwrap();
        let dir = session.config().user_dir(USER);
        assert!(dir.exists());

        let other = session.switch_user("u2").await.unwrap();
        assert!(!dir.exists());
        assert_eq!(other.user_id(), "u2");
        assert!(other.list(Table::Calendar).await.unwrap().is_empty());
        assert!(other.pending_operations().await.unwrap().is_empty());

        other.close().await.unwrap();
        assert!(matches!(
            other.insert(Table::Calendar, Map::new()).await,
            Err(CalendarSyncError::ShuttingDown(_))
        ));
    }

    #[tokio::test]
    async fn logout_keeps_data_when_configured() {
        let h = Harness::new();
        let mut config = h.config(false);
        config.clear_on_logout = false;
        let session = CalendarSync::builder(config)
            .remote(h.remote.clone())
            .clock(h.clock.clone())
            .open(USER)
            .await
            .unwrap();
        session
            .insert(Table::Calendar, row(json!({"id": "c1"})))
            .await
            .unwrap();
        session.logout().await.unwrap();

        let reopened = h.builder(false).open(USER).await.unwrap();
        assert!(reopened.get(Table::Calendar, &"c1".into()).await.unwrap().is_some());
        assert_eq!(reopened.pending_operations().await.unwrap().len(), 1);
    }

    /// 自动启动：修改经调度器推送，回到前台时拉取，feed 事件实时写入
    #[tokio::test]
    async fn background_sync_end_to_end() {
        let h = Harness::new();
        let feed = InMemoryChangeFeed::new();
        let session = h
            .builder(true)
            .change_feed(Arc::new(feed.clone()))
            .open(USER)
            .await
            .unwrap();

        session
            .insert(Table::Calendar, row(json!({"id": "c1"})))
            .await
            .unwrap();
        for _ in 0..300 {
            if h.remote.rows("calendars").len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.remote.rows("calendars").len(), 1);

        h.clock.advance(chrono::Duration::seconds(1));
        h.remote.seed(
            "categories",
            vec![row(json!({"id": "k1", "user_id": USER, "updated_at": to_iso(h.clock.now())}))],
        );
        session.enter_foreground().await.unwrap();
        for _ in 0..300 {
            if session.get(Table::Category, &"k1".into()).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.get(Table::Category, &"k1".into()).await.unwrap().is_some());

        for _ in 0..300 {
            if feed.subscriber_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        feed.publish(
            USER,
            crate::remote::ChangeEvent {
                table: "personas".to_string(),
                event_type: OpKind::Insert,
                old: None,
                new: Some(row(json!({"id": "p1", "user_id": USER}))),
            },
        );
        for _ in 0..300 {
            if session.get(Table::Persona, &"p1".into()).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.get(Table::Persona, &"p1".into()).await.unwrap().is_some());

        session.logout().await.unwrap();
        assert_eq!(feed.subscriber_count(), 0);
    }
}
