//! 存储模块 - 本地优先的数据持久化层
//!
//! 分层：
//! - LocalStore: 对外的存储接口（记录读写、二级索引查询、事务）
//! - OutboxQueue / WatermarkStore: 同一数据库中的同步基础表
//! - DB Actor: 单线程持有 SQLite 连接
//! - DAO Layer: 每张表一个操作模块
//!
//! 除存储引擎故障外（致命，直接上抛），读写操作不返回错误。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{CalendarSyncError, Result};
use crate::events::{event_builders, ChangeOrigin, EventManager, RecordChange};
use crate::schema::{RecordKey, Table};
use crate::utils::time::{Clock, IdGenerator, SystemClock, UuidGenerator};

pub mod dao;
pub mod db_actor;
pub mod entities;
pub mod migrate;
pub mod queue;

pub use entities::*;
pub use queue::{OutboxQueue, PushFailureKind, RetryPolicy};

use db_actor::DbActorHandle;

/// 单个用户的本地库
///
/// 克隆共享同一个 DB Actor。同一数据库文件可由多个 `LocalStore`（多进程/多窗口）同时打开。
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    db: DbActorHandle,
    events: Arc<EventManager>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.inner.path)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// LocalStore 构建器：时钟、ID 生成器、事件总线可替换
pub struct LocalStoreBuilder {
    path: PathBuf,
    events: Option<Arc<EventManager>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    event_capacity: usize,
}

impl LocalStoreBuilder {
    pub fn events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
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

    pub async fn open(self) -> Result<LocalStore> {
        let db = DbActorHandle::spawn()?;
        if let Err(e) = db.open(self.path.clone()).await {
            db.shutdown();
            return Err(e);
        }
        info!("本地库已打开: {}", self.path.display());
        Ok(LocalStore {
            inner: Arc::new(StoreInner {
                path: self.path,
                db,
                events: self
                    .events
                    .unwrap_or_else(|| Arc::new(EventManager::new(self.event_capacity))),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                ids: self.ids.unwrap_or_else(|| Arc::new(UuidGenerator)),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl LocalStore {
    pub fn builder(path: impl Into<PathBuf>) -> LocalStoreBuilder {
        LocalStoreBuilder {
            path: path.into(),
            events: None,
            clock: None,
            ids: None,
            event_capacity: 256,
        }
    }

    /// 使用系统时钟与 UUID 打开
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(path).open().await
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.inner.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn id_generator(&self) -> &Arc<dyn IdGenerator> {
        &self.inner.ids
    }

    pub fn outbox(&self) -> OutboxQueue {
        OutboxQueue::new(
            self.inner.db.clone(),
            self.inner.events.clone(),
            self.inner.clock.clone(),
            self.inner.ids.clone(),
        )
    }

    pub fn watermarks(&self) -> crate::sync::WatermarkStore {
        crate::sync::WatermarkStore::new(self.inner.db.clone())
    }

    pub(crate) fn db(&self) -> &DbActorHandle {
        &self.inner.db
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CalendarSyncError::ShuttingDown("本地库已关闭".to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, table: Table, key: &RecordKey) -> Result<Option<Record>> {
        self.ensure_open()?;
        self.inner.db.get_record(table, key.clone()).await
    }

    /// 整行写入（不入 outbox）
    pub async fn put(&self, record: Record) -> Result<()> {
        self.transaction(vec![RecordWrite::Put(record)]).await
    }

    /// 删除（不入 outbox）；记录不存在时静默成功
    pub async fn delete(&self, table: Table, key: &RecordKey) -> Result<()> {
        self.transaction(vec![RecordWrite::Delete {
            table,
            key: key.clone(),
        }])
        .await
    }

    pub async fn query(&self, table: Table, query: IndexQuery) -> Result<Vec<Record>> {
        self.ensure_open()?;
        self.inner.db.query_records(table, query).await
    }

    pub async fn list(&self, table: Table) -> Result<Vec<Record>> {
        self.ensure_open()?;
        self.inner.db.list_records(table).await
    }

    /// 跨表原子写入：任一失败则全部回滚
    pub async fn transaction(&self, writes: Vec<RecordWrite>) -> Result<()> {
        self.ensure_open()?;
        if writes.is_empty() {
            return Ok(());
        }
        let mut changes: BTreeMap<Table, Vec<RecordChange>> = BTreeMap::new();
        for write in &writes {
            match write {
                RecordWrite::Put(record) => changes
                    .entry(record.table)
                    .or_default()
                    .push(RecordChange::upserted(record.key.clone())),
                RecordWrite::Delete { table, key } => changes
                    .entry(*table)
                    .or_default()
                    .push(RecordChange::deleted(key.clone())),
            }
        }
        self.inner.db.write(writes).await?;
        self.publish(ChangeOrigin::Local, changes).await;
        Ok(())
    }

    /// 本地修改：乐观写入 + 合并入队，同一事务
    pub async fn apply_mutations(
        &self,
        user_id: &str,
        mutations: Vec<PreparedMutation>,
    ) -> Result<MutationResult> {
        self.ensure_open()?;
        if mutations.is_empty() {
            return Ok(MutationResult::default());
        }
        let mut changes: BTreeMap<Table, Vec<RecordChange>> = BTreeMap::new();
        for mutation in &mutations {
            let change = match mutation.op {
                OpKind::Delete => RecordChange::deleted(mutation.key.clone()),
                _ => RecordChange::upserted(mutation.key.clone()),
            };
            changes.entry(mutation.table).or_default().push(change);
        }

        let result = self
            .inner
            .db
            .apply_mutations(user_id.to_string(), mutations)
            .await?;
        self.publish(ChangeOrigin::Local, changes).await;
        self.outbox().notify(user_id).await?;
        Ok(result)
    }

    /// 远端变化：按跳过规则写入；仅 pull 推进水位
    pub async fn apply_remote(
        &self,
        user_id: &str,
        table: Table,
        changes: Vec<RemoteChange>,
        origin: ChangeOrigin,
    ) -> Result<ApplyReport> {
        self.ensure_open()?;
        let advance_watermark = origin == ChangeOrigin::Pull;
        let report = self
            .inner
            .db
            .apply_remote(user_id.to_string(), table, changes, advance_watermark)
            .await?;

        if report.changed() > 0 {
            let changes = report
                .upserted
                .iter()
                .cloned()
                .map(RecordChange::upserted)
                .chain(report.deleted.iter().cloned().map(RecordChange::deleted))
                .collect();
            self.publish(origin, BTreeMap::from([(table, changes)])).await;
        }
        Ok(report)
    }

    async fn publish(&self, origin: ChangeOrigin, changes: BTreeMap<Table, Vec<RecordChange>>) {
        for (table, changes) in changes {
            self.inner
                .events
                .emit(event_builders::records_changed(table, origin, changes))
                .await;
        }
    }

    /// 关闭连接并停止 actor；之后的调用返回 ShuttingDown
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.inner.db.close().await;
        self.inner.db.shutdown();
        debug!("本地库已关闭: {}", self.inner.path.display());
        result
    }
}
