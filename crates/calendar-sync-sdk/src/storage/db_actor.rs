//! 数据库 Actor - 单线程数据库访问模型
//!
//! - SQLite Connection 只存在于一个专用线程中
//! - 所有数据库操作通过 channel 发送命令，结果经 oneshot 返回
//! - 多步写入（本地表 + outbox + 水位）在 actor 内一个事务中完成

use std::path::PathBuf;
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::error::{CalendarSyncError, Result};
use crate::schema::{RecordKey, Table};
use crate::storage::dao::{
    applier, LeaseDao, NewOperation, OutboxDao, RecordDao, TransactionManager, WatermarkDao,
};
use crate::storage::entities::{
    ApplyReport, EnqueueOutcome, IndexQuery, MutationResult, OpKind, OutboxAck, OutboxCounts,
    OutboxOperation, OutboxRetry, PreparedMutation, Record, RecordWrite, RemoteChange,
};
use crate::storage::migrate;

type Responder<T> = tokio::sync::oneshot::Sender<Result<T>>;

/// 数据库命令
pub enum DbCommand {
    /// 打开（必要时创建并迁移）数据库文件
    Open {
        path: PathBuf,
        respond_to: Responder<()>,
    },

    GetRecord {
        table: Table,
        key: RecordKey,
        respond_to: Responder<Option<Record>>,
    },

    ListRecords {
        table: Table,
        respond_to: Responder<Vec<Record>>,
    },

    QueryRecords {
        table: Table,
        query: IndexQuery,
        respond_to: Responder<Vec<Record>>,
    },

    /// 原子写入多表（不入 outbox）
    Write {
        writes: Vec<RecordWrite>,
        respond_to: Responder<()>,
    },

    /// 本地修改：写本地表 + 入队，同一事务
    ApplyMutations {
        user_id: String,
        mutations: Vec<PreparedMutation>,
        respond_to: Responder<MutationResult>,
    },

    /// 远端变化：按跳过规则写本地表，可选推进水位，同一事务
    ApplyRemote {
        user_id: String,
        table: Table,
        changes: Vec<RemoteChange>,
        advance_watermark: bool,
        respond_to: Responder<ApplyReport>,
    },

    OutboxEnqueue {
        id: String,
        user_id: String,
        table: String,
        record_key: RecordKey,
        op: OpKind,
        payload: Map<String, Value>,
        now: DateTime<Utc>,
        respond_to: Responder<EnqueueOutcome>,
    },

    OutboxList {
        user_id: String,
        respond_to: Responder<Vec<OutboxOperation>>,
    },

    OutboxDue {
        user_id: String,
        now: DateTime<Utc>,
        respond_to: Responder<Vec<OutboxOperation>>,
    },

    OutboxHasLive {
        user_id: String,
        table: String,
        record_key: RecordKey,
        respond_to: Responder<bool>,
    },

    OutboxAck {
        acks: Vec<OutboxAck>,
        respond_to: Responder<usize>,
    },

    OutboxMarkDispatched {
        ids: Vec<String>,
        respond_to: Responder<Vec<String>>,
    },

    OutboxRetry {
        retries: Vec<OutboxRetry>,
        respond_to: Responder<usize>,
    },

    OutboxPark {
        acks: Vec<OutboxAck>,
        error: String,
        respond_to: Responder<usize>,
    },

    OutboxRetryParked {
        user_id: String,
        respond_to: Responder<usize>,
    },

    OutboxCounts {
        user_id: String,
        respond_to: Responder<OutboxCounts>,
    },

    WatermarkGet {
        table: String,
        user_id: String,
        respond_to: Responder<Option<DateTime<Utc>>>,
    },

    WatermarkAdvance {
        table: String,
        user_id: String,
        timestamp: DateTime<Utc>,
        respond_to: Responder<DateTime<Utc>>,
    },

    WatermarkList {
        user_id: String,
        respond_to: Responder<Vec<(String, DateTime<Utc>)>>,
    },

    LeaseAcquire {
        name: String,
        holder: String,
        ttl_ms: i64,
        now_ms: i64,
        respond_to: Responder<bool>,
    },

    LeaseRenew {
        name: String,
        holder: String,
        ttl_ms: i64,
        now_ms: i64,
        respond_to: Responder<bool>,
    },

    LeaseRelease {
        name: String,
        holder: String,
        respond_to: Responder<()>,
    },

    /// 关闭连接（actor 线程继续运行，可再次 Open）
    Close { respond_to: Responder<()> },

    /// 停止 Actor
    Shutdown,
}

/// 数据库 Actor（运行在独立线程）
pub struct DbActor {
    connection: Option<Connection>,
    receiver: Receiver<DbCommand>,
    thread_id: thread::ThreadId,
}

impl DbActor {
    fn new(receiver: Receiver<DbCommand>) -> Self {
        let thread_id = thread::current().id();
        debug!("🚀 [Thread {:?}] DbActor 已启动", thread_id);
        Self {
            connection: None,
            receiver,
            thread_id,
        }
    }

    fn run(mut self) {
        while let Ok(command) = self.receiver.recv() {
            match command {
                DbCommand::Shutdown => {
                    info!("🛑 [Thread {:?}] DbActor 收到停止信号", self.thread_id);
                    break;
                }
                DbCommand::Open { path, respond_to } => {
                    let _ = respond_to.send(self.handle_open(path));
                }
                DbCommand::Close { respond_to } => {
                    self.connection = None;
                    let _ = respond_to.send(Ok(()));
                }
                DbCommand::GetRecord {
                    table,
                    key,
                    respond_to,
                } => {
                    let result = self.with_conn(|conn| RecordDao::new(conn).get(table, &key));
                    let _ = respond_to.send(result);
                }
                DbCommand::ListRecords { table, respond_to } => {
                    let result = self.with_conn(|conn| RecordDao::new(conn).list(table));
                    let _ = respond_to.send(result);
                }
                DbCommand::QueryRecords {
                    table,
                    query,
                    respond_to,
                } => {
                    let result = self.with_conn(|conn| RecordDao::new(conn).query(table, &query));
                    let _ = respond_to.send(result);
                }
                DbCommand::Write { writes, respond_to } => {
                    let result = self.in_transaction(|tx| {
                        let records = RecordDao::new(tx);
                        for write in &writes {
                            match write {
                                RecordWrite::Put(record) => records.put(record)?,
                                RecordWrite::Delete { table, key } => {
                                    records.delete(*table, key)?;
                                }
                            }
                        }
                        Ok(())
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::ApplyMutations {
                    user_id,
                    mutations,
                    respond_to,
                } => {
                    let result = self
                        .in_transaction(|tx| applier::apply_mutations(tx, &user_id, mutations));
                    let _ = respond_to.send(result);
                }
                DbCommand::ApplyRemote {
                    user_id,
                    table,
                    changes,
                    advance_watermark,
                    respond_to,
                } => {
                    let result = self.in_transaction(|tx| {
                        applier::apply_remote(tx, &user_id, table, &changes, advance_watermark)
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::OutboxEnqueue {
                    id,
                    user_id,
                    table,
                    record_key,
                    op,
                    payload,
                    now,
                    respond_to,
                } => {
                    let result = self.in_transaction(|tx| {
                        OutboxDao::new(tx).enqueue(NewOperation {
                            id,
                            user_id: &user_id,
                            table: &table,
                            record_key: &record_key,
                            op,
                            payload,
                            now,
                        })
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::OutboxList {
                    user_id,
                    respond_to,
                } => {
                    let result = self.with_conn(|conn| OutboxDao::new(conn).list(&user_id));
                    let _ = respond_to.send(result);
                }
                DbCommand::OutboxDue {
                    user_id,
                    now,
                    respond_to,
                } => {
                    let result = self.with_conn(|conn| OutboxDao::new(conn).due(&user_id, now));
                    let _ = respond_to.send(result);
                }
                DbCommand::OutboxHasLive {
                    user_id,
                    table,
                    record_key,
                    respond_to,
                } => {
                    let result = self.with_conn(|conn| {
                        OutboxDao::new(conn).has_live(&user_id, &table, &record_key)
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::OutboxAck { acks, respond_to } => {
                    let result = self.in_transaction(|tx| OutboxDao::new(tx).ack(&acks));
                    let _ = respond_to.send(result);
                }
                DbCommand::OutboxMarkDispatched { ids, respond_to } => {
                    let result =
                        self.in_transaction(|tx| OutboxDao::new(tx).mark_dispatched(&ids));
                    let _ = respond_to.send(result);
                }
                DbCommand::OutboxRetry {
                    retries,
                    respond_to,
                } => {
                    let result = self.in_transaction(|tx| {
                        let outbox = OutboxDao::new(tx);
                        let mut updated = 0;
                        for retry in &retries {
                            if outbox.record_retry(retry)? {
                                updated += 1;
                            }
                        }
                        Ok(updated)
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::OutboxPark {
                    acks,
                    error,
                    respond_to,
                } => {
                    let result = self.in_transaction(|tx| {
                        let outbox = OutboxDao::new(tx);
                        let mut parked = 0;
                        for ack in &acks {
                            if outbox.park(ack, &error)? {
                                parked += 1;
                            }
                        }
                        Ok(parked)
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::OutboxRetryParked {
                    user_id,
                    respond_to,
                } => {
                    let result =
                        self.with_conn(|conn| OutboxDao::new(conn).retry_parked(&user_id));
                    let _ = respond_to.send(result);
                }
                DbCommand::OutboxCounts {
                    user_id,
                    respond_to,
                } => {
                    let result = self.with_conn(|conn| OutboxDao::new(conn).counts(&user_id));
                    let _ = respond_to.send(result);
                }
                DbCommand::WatermarkGet {
                    table,
                    user_id,
                    respond_to,
                } => {
                    let result =
                        self.with_conn(|conn| WatermarkDao::new(conn).get(&table, &user_id));
                    let _ = respond_to.send(result);
                }
                DbCommand::WatermarkAdvance {
                    table,
                    user_id,
                    timestamp,
                    respond_to,
                } => {
                    let result = self.in_transaction(|tx| {
                        WatermarkDao::new(tx).advance(&table, &user_id, timestamp)
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::WatermarkList {
                    user_id,
                    respond_to,
                } => {
                    let result = self.with_conn(|conn| WatermarkDao::new(conn).list(&user_id));
                    let _ = respond_to.send(result);
                }
                DbCommand::LeaseAcquire {
                    name,
                    holder,
                    ttl_ms,
                    now_ms,
                    respond_to,
                } => {
                    let result = self.with_conn(|conn| {
                        LeaseDao::new(conn).try_acquire(&name, &holder, ttl_ms, now_ms)
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::LeaseRenew {
                    name,
                    holder,
                    ttl_ms,
                    now_ms,
                    respond_to,
                } => {
                    let result = self.with_conn(|conn| {
                        LeaseDao::new(conn).renew(&name, &holder, ttl_ms, now_ms)
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::LeaseRelease {
                    name,
                    holder,
                    respond_to,
                } => {
                    let result =
                        self.with_conn(|conn| LeaseDao::new(conn).release(&name, &holder));
                    let _ = respond_to.send(result);
                }
            }
        }

        debug!("✅ [Thread {:?}] DbActor 已停止", self.thread_id);
    }

    fn handle_open(&mut self, path: PathBuf) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(&path).map_err(|e| {
            error!(
                "❌ [DbActor Thread {:?}] 打开数据库失败: path={}, error={}",
                self.thread_id,
                path.display(),
                e
            );
            CalendarSyncError::Database(format!("打开数据库失败: {}", e))
        })?;
        migrate::init_db(&mut conn)?;
        info!(
            "✅ [DbActor Thread {:?}] 数据库已打开: {}",
            self.thread_id,
            path.display()
        );
        self.connection = Some(conn);
        Ok(())
    }

    fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self
            .connection
            .as_ref()
            .ok_or_else(|| CalendarSyncError::NotInitialized("数据库未打开".to_string()))?;
        f(conn)
    }

    fn in_transaction<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        self.with_conn(|conn| TransactionManager::new(conn).execute(f))
    }
}

/// 数据库 Actor 句柄（用于异步调用）
#[derive(Clone)]
pub struct DbActorHandle {
    sender: Sender<DbCommand>,
}

impl std::fmt::Debug for DbActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbActorHandle")
            .field("sender", &"<channel>")
            .finish()
    }
}

impl DbActorHandle {
    /// 启动 DB Actor 专用线程
    pub fn spawn() -> Result<Self> {
        let (sender, receiver) = unbounded();
        thread::Builder::new()
            .name("calendar-db-actor".to_string())
            .spawn(move || DbActor::new(receiver).run())
            .map_err(|e| CalendarSyncError::IO(format!("无法启动 DB Actor 线程: {}", e)))?;
        Ok(Self { sender })
    }

    async fn request<T>(&self, build: impl FnOnce(Responder<T>) -> DbCommand) -> Result<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(build(tx))
            .map_err(|_| CalendarSyncError::ShuttingDown("DB Actor 已停止".to_string()))?;
        rx.await
            .map_err(|_| CalendarSyncError::ShuttingDown("DB Actor 响应失败".to_string()))?
    }

    pub async fn open(&self, path: PathBuf) -> Result<()> {
        self.request(|respond_to| DbCommand::Open { path, respond_to })
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.request(|respond_to| DbCommand::Close { respond_to }).await
    }

    /// 停止 actor 线程；之后所有请求返回 ShuttingDown
    pub fn shutdown(&self) {
        let _ = self.sender.send(DbCommand::Shutdown);
    }

    pub async fn get_record(&self, table: Table, key: RecordKey) -> Result<Option<Record>> {
        self.request(|respond_to| DbCommand::GetRecord {
            table,
            key,
            respond_to,
        })
        .await
    }

    pub async fn list_records(&self, table: Table) -> Result<Vec<Record>> {
        self.request(|respond_to| DbCommand::ListRecords { table, respond_to })
            .await
    }

    pub async fn query_records(&self, table: Table, query: IndexQuery) -> Result<Vec<Record>> {
        self.request(|respond_to| DbCommand::QueryRecords {
            table,
            query,
            respond_to,
        })
        .await
    }

    pub async fn write(&self, writes: Vec<RecordWrite>) -> Result<()> {
        self.request(|respond_to| DbCommand::Write { writes, respond_to })
            .await
    }

    pub async fn apply_mutations(
        &self,
        user_id: String,
        mutations: Vec<PreparedMutation>,
    ) -> Result<MutationResult> {
        self.request(|respond_to| DbCommand::ApplyMutations {
            user_id,
            mutations,
            respond_to,
        })
        .await
    }

    pub async fn apply_remote(
        &self,
        user_id: String,
        table: Table,
        changes: Vec<RemoteChange>,
        advance_watermark: bool,
    ) -> Result<ApplyReport> {
        self.request(|respond_to| DbCommand::ApplyRemote {
            user_id,
            table,
            changes,
            advance_watermark,
            respond_to,
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn outbox_enqueue(
        &self,
        id: String,
        user_id: String,
        table: String,
        record_key: RecordKey,
        op: OpKind,
        payload: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        self.request(|respond_to| DbCommand::OutboxEnqueue {
            id,
            user_id,
            table,
            record_key,
            op,
            payload,
            now,
            respond_to,
        })
        .await
    }

    pub async fn outbox_list(&self, user_id: String) -> Result<Vec<OutboxOperation>> {
        self.request(|respond_to| DbCommand::OutboxList {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn outbox_due(
        &self,
        user_id: String,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxOperation>> {
        self.request(|respond_to| DbCommand::OutboxDue {
            user_id,
            now,
            respond_to,
        })
        .await
    }

    pub async fn outbox_has_live(
        &self,
        user_id: String,
        table: String,
        record_key: RecordKey,
    ) -> Result<bool> {
        self.request(|respond_to| DbCommand::OutboxHasLive {
            user_id,
            table,
            record_key,
            respond_to,
        })
        .await
    }

    pub async fn outbox_ack(&self, acks: Vec<OutboxAck>) -> Result<usize> {
        self.request(|respond_to| DbCommand::OutboxAck { acks, respond_to })
            .await
    }

    pub async fn outbox_mark_dispatched(&self, ids: Vec<String>) -> Result<Vec<String>> {
        self.request(|respond_to| DbCommand::OutboxMarkDispatched { ids, respond_to })
            .await
    }

    pub async fn outbox_retry(&self, retries: Vec<OutboxRetry>) -> Result<usize> {
        self.request(|respond_to| DbCommand::OutboxRetry {
            retries,
            respond_to,
        })
        .await
    }

    pub async fn outbox_park(&self, acks: Vec<OutboxAck>, error: String) -> Result<usize> {
        self.request(|respond_to| DbCommand::OutboxPark {
            acks,
            error,
            respond_to,
        })
        .await
    }

    pub async fn outbox_retry_parked(&self, user_id: String) -> Result<usize> {
        self.request(|respond_to| DbCommand::OutboxRetryParked {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn outbox_counts(&self, user_id: String) -> Result<OutboxCounts> {
        self.request(|respond_to| DbCommand::OutboxCounts {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn watermark_get(
        &self,
        table: String,
        user_id: String,
    ) -> Result<Option<DateTime<Utc>>> {
        self.request(|respond_to| DbCommand::WatermarkGet {
            table,
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn watermark_advance(
        &self,
        table: String,
        user_id: String,
        timestamp: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        self.request(|respond_to| DbCommand::WatermarkAdvance {
            table,
            user_id,
            timestamp,
            respond_to,
        })
        .await
    }

    pub async fn watermark_list(&self, user_id: String) -> Result<Vec<(String, DateTime<Utc>)>> {
        self.request(|respond_to| DbCommand::WatermarkList {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn lease_acquire(
        &self,
        name: String,
        holder: String,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<bool> {
        self.request(|respond_to| DbCommand::LeaseAcquire {
            name,
            holder,
            ttl_ms,
            now_ms,
            respond_to,
        })
        .await
    }

    pub async fn lease_renew(
        &self,
        name: String,
        holder: String,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<bool> {
        self.request(|respond_to| DbCommand::LeaseRenew {
            name,
            holder,
            ttl_ms,
            now_ms,
            respond_to,
        })
        .await
    }

    pub async fn lease_release(&self, name: String, holder: String) -> Result<()> {
        self.request(|respond_to| DbCommand::LeaseRelease {
            name,
            holder,
            respond_to,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn commands_fail_before_open_and_after_shutdown() {
        let handle = DbActorHandle::spawn().unwrap();
        let err = handle.list_records(Table::Event).await.unwrap_err();
        assert!(matches!(err, CalendarSyncError::NotInitialized(_)));

        handle.shutdown();
        let err = handle.list_records(Table::Event).await.unwrap_err();
        assert!(matches!(err, CalendarSyncError::ShuttingDown(_)));
    }

    #[tokio::test]
    async fn write_is_atomic_across_tables() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DbActorHandle::spawn().unwrap();
        handle
            .open(dir.path().join("nested").join("calendar.db"))
            .await
            .unwrap();

        let event = Record::from_row(
            Table::Event,
            json!({"id": "e1"}).as_object().cloned().unwrap(),
        )
        .unwrap();
        let detail = Record::from_row(
            Table::EventDetail,
            json!({"event_id": "e1", "notes": "n"}).as_object().cloned().unwrap(),
        )
        .unwrap();
        handle
            .write(vec![RecordWrite::Put(event), RecordWrite::Put(detail)])
            .await
            .unwrap();
        assert_eq!(handle.list_records(Table::EventDetail).await.unwrap().len(), 1);

        handle
            .write(vec![
                RecordWrite::Delete {
                    table: Table::Event,
                    key: "e1".into(),
                },
                RecordWrite::Delete {
                    table: Table::EventDetail,
                    key: "e1".into(),
                },
            ])
            .await
            .unwrap();
        assert!(handle.get_record(Table::Event, "e1".into()).await.unwrap().is_none());
        handle.close().await.unwrap();
    }
}
