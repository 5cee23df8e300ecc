//! Outbox 队列 - 未被远端确认的本地修改
//!
//! 写入方只有两类：本地修改入口（入队）与推送路径（确认、退避、挂起）。
//! 每条记录至多一条活动操作，合并规则见 [`crate::storage::dao::OutboxDao::enqueue`]。

pub mod retry_policy;

pub use retry_policy::{PushFailureKind, RetryPolicy};

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::schema::RecordKey;
use crate::storage::db_actor::DbActorHandle;
use crate::storage::entities::{
    EnqueueOutcome, OpKind, OutboxAck, OutboxCounts, OutboxOperation, OutboxRetry,
};
use crate::utils::time::{Clock, IdGenerator};

#[derive(Clone)]
pub struct OutboxQueue {
    db: DbActorHandle,
    events: Arc<EventManager>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl std::fmt::Debug for OutboxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxQueue").field("db", &self.db).finish()
    }
}

impl OutboxQueue {
    pub(crate) fn new(
        db: DbActorHandle,
        events: Arc<EventManager>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            db,
            events,
            clock,
            ids,
        }
    }

    /// 合并入队（单独使用；本地修改入口走 `LocalStore::apply_mutations`，与本地写入同一事务）
    pub async fn enqueue(
        &self,
        user_id: &str,
        table: &str,
        op: OpKind,
        payload: Map<String, Value>,
        record_key: RecordKey,
    ) -> Result<EnqueueOutcome> {
        let outcome = self
            .db
            .outbox_enqueue(
                self.ids.next_id(),
                user_id.to_string(),
                table.to_string(),
                record_key,
                op,
                payload,
                self.clock.now(),
            )
            .await?;
        self.notify(user_id).await?;
        Ok(outcome)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<OutboxOperation>> {
        self.db.outbox_list(user_id.to_string()).await
    }

    /// 当前可推送的操作（未挂起、退避已到期），按 created_at 排序
    pub async fn due(&self, user_id: &str) -> Result<Vec<OutboxOperation>> {
        self.db
            .outbox_due(user_id.to_string(), self.clock.now())
            .await
    }

    pub async fn has_pending(&self, user_id: &str, table: &str, key: &RecordKey) -> Result<bool> {
        self.db
            .outbox_has_live(user_id.to_string(), table.to_string(), key.clone())
            .await
    }

    /// 推送成功：删除 revision 未变的操作
    pub async fn acknowledge(&self, operations: &[OutboxOperation]) -> Result<usize> {
        if operations.is_empty() {
            return Ok(0);
        }
        let acks: Vec<OutboxAck> = operations.iter().map(OutboxOperation::ack).collect();
        let removed = self.db.outbox_ack(acks).await?;
        debug!("outbox 确认 {} / {} 条", removed, operations.len());
        Ok(removed)
    }

    /// 发往远端之前调用：标记后这些记录可能已存在于远端。
    /// 返回仍在队列中的操作；读取后被取消的操作不应再发送。
    pub async fn mark_dispatched(
        &self,
        operations: &[OutboxOperation],
    ) -> Result<Vec<OutboxOperation>> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }
        let ids = operations.iter().map(|op| op.id.clone()).collect();
        let live = self.db.outbox_mark_dispatched(ids).await?;
        Ok(operations
            .iter()
            .filter(|op| live.contains(&op.id))
            .map(|op| OutboxOperation {
                dispatched: true,
                ..op.clone()
            })
            .collect())
    }

    /// 暂时性失败：attempts + 1，按策略安排下次尝试
    pub async fn schedule_retry(
        &self,
        operations: &[OutboxOperation],
        policy: &RetryPolicy,
    ) -> Result<Vec<OutboxRetry>> {
        let now = self.clock.now();
        let retries: Vec<OutboxRetry> = operations
            .iter()
            .map(|op| {
                let attempts = op.attempts.saturating_add(1);
                OutboxRetry {
                    id: op.id.clone(),
                    revision: op.revision,
                    attempts,
                    next_attempt_at: policy.next_attempt_at(now, attempts),
                }
            })
            .collect();
        if !retries.is_empty() {
            self.db.outbox_retry(retries.clone()).await?;
        }
        Ok(retries)
    }

    /// 永久失败：记录 last_error，不再自动重试
    pub async fn park(&self, operations: &[OutboxOperation], error: &str) -> Result<usize> {
        if operations.is_empty() {
            return Ok(0);
        }
        let acks = operations.iter().map(OutboxOperation::ack).collect();
        self.db.outbox_park(acks, error.to_string()).await
    }

    /// 外部干预（例如重新认证）后恢复挂起的操作
    pub async fn retry_parked(&self, user_id: &str) -> Result<usize> {
        let resumed = self.db.outbox_retry_parked(user_id.to_string()).await?;
        if resumed > 0 {
            info!("恢复 {} 条挂起的 outbox 操作: user={}", resumed, user_id);
            self.notify(user_id).await?;
        }
        Ok(resumed)
    }

    pub async fn counts(&self, user_id: &str) -> Result<OutboxCounts> {
        self.db.outbox_counts(user_id.to_string()).await
    }

    pub(crate) async fn notify(&self, user_id: &str) -> Result<()> {
        let counts = self.counts(user_id).await?;
        self.events
            .emit(event_builders::outbox_changed(user_id, counts))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use crate::utils::time::ManualClock;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn retries_accumulate_attempts_and_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::at_millis(1_770_000_000_000));
        let store = LocalStore::builder(dir.path().join("calendar.db"))
            .clock(clock.clone())
            .open()
            .await
            .unwrap();
        let outbox = store.outbox();
        outbox
            .enqueue("u1", "events", OpKind::Insert, payload(json!({"id": "a"})), "a".into())
            .await
            .unwrap();

        let policy = RetryPolicy::default();
        let expected = [2_000i64, 4_000, 8_000];
        for (i, base) in expected.iter().enumerate() {
            let due = outbox.due("u1").await.unwrap();
            assert_eq!(due.len(), 1, "第 {} 次应当到期", i + 1);
            let retries = outbox.schedule_retry(&due, &policy).await.unwrap();
            assert_eq!(retries[0].attempts, (i + 1) as u32);
            let delay = (retries[0].next_attempt_at - clock.now()).num_milliseconds();
            assert!((delay - base).abs() <= base / 10, "delay={} base={}", delay, base);
            assert!(outbox.due("u1").await.unwrap().is_empty());
            clock.advance(chrono::Duration::milliseconds(delay));
        }

        let ops = outbox.list("u1").await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].attempts, 3);
    }

    #[tokio::test]
    async fn parked_operations_stay_parked_until_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("calendar.db")).await.unwrap();
        let outbox = store.outbox();
        outbox
            .enqueue("u1", "calendars", OpKind::Update, payload(json!({"id": "c"})), "c".into())
            .await
            .unwrap();
        let due = outbox.due("u1").await.unwrap();
        assert_eq!(outbox.park(&due, "401").await.unwrap(), 1);

        assert!(outbox.due("u1").await.unwrap().is_empty());
        let ops = outbox.list("u1").await.unwrap();
        assert_eq!(ops[0].last_error.as_deref(), Some("401"));
        assert_eq!(ops[0].attempts, 0);
        let counts = outbox.counts("u1").await.unwrap();
        assert_eq!((counts.pending, counts.parked), (0, 1));

        assert_eq!(outbox.retry_parked("u1").await.unwrap(), 1);
        assert_eq!(outbox.due("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enqueue_emits_outbox_changed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("calendar.db")).await.unwrap();
        let mut events = store.events().subscribe();
        store
            .outbox()
            .enqueue("u1", "events", OpKind::Insert, payload(json!({"id": "x"})), "x".into())
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            crate::events::SyncEvent::OutboxChanged { counts, .. } => assert_eq!(counts.pending, 1),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
