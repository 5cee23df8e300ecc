//! change feed 桥接
//!
//! 订阅服务端按用户推送的行级变更，按与 pull 相同的跳过规则写入本地库。
//! 每次（重新）订阅成功后执行一次全表增量 pull，补齐断线期间漏掉的事件；
//! feed 事件本身不推进水位。

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::ChangeOrigin;
use crate::remote::{ChangeEvent, ChangeFeedSource, FeedMessage};
use crate::schema::Table;
use crate::storage::entities::{ApplyReport, OpKind, RemoteChange};
use crate::sync::SyncOrchestrator;

pub struct ChangeFeedBridge {
    source: Arc<dyn ChangeFeedSource>,
    orchestrator: Arc<SyncOrchestrator>,
    reconnect_delay: Duration,
}

impl ChangeFeedBridge {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        orchestrator: Arc<SyncOrchestrator>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            source,
            orchestrator,
            reconnect_delay,
        }
    }

    /// 应用单条事件；未登记的表忽略
    pub async fn apply_event(&self, user_id: &str, event: ChangeEvent) -> Result<ApplyReport> {
        let table: Table = match event.table.parse() {
            Ok(table) => table,
            Err(_) => {
                debug!("忽略未登记表的 feed 事件: {}", event.table);
                return Ok(ApplyReport::default());
            }
        };

        let change = match event.event_type {
            OpKind::Delete => {
                let row = event.old.as_ref().or(event.new.as_ref());
                let key = match row.map(|row| table.key_of(row)).transpose() {
                    Ok(Some(key)) => key,
                    Ok(None) => {
                        warn!("feed delete 事件缺少行数据: table={}", table);
                        return Ok(ApplyReport::default());
                    }
                    Err(e) => {
                        warn!("feed delete 事件缺少主键: table={}, error={}", table, e);
                        return Ok(ApplyReport::default());
                    }
                };
                RemoteChange::Delete {
                    key,
                    updated_at: None,
                }
            }
            OpKind::Insert | OpKind::Update => {
                let Some(row) = event.new else {
                    warn!("feed {} 事件缺少 new: table={}", event.event_type, table);
                    return Ok(ApplyReport::default());
                };
                match RemoteChange::from_row(table, row) {
                    Ok(change) => change,
                    Err(e) => {
                        warn!("忽略无效的 feed 行: table={}, error={}", table, e);
                        return Ok(ApplyReport::default());
                    }
                }
            }
        };

        self.orchestrator
            .store()
            .apply_remote(user_id, table, vec![change], ChangeOrigin::Feed)
            .await
    }

    /// 订阅循环，直到 `cancel` 触发；本地存储错误终止循环并返回
    pub async fn run(&self, user_id: &str, cancel: CancellationToken) -> Result<()> {
        info!("启动 change feed: user={}", user_id);
        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.source.subscribe(user_id) => result,
            };
            match subscribed {
                Ok(mut stream) => loop {
                    let message = tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("change feed 已停止: user={}", user_id);
                            return Ok(());
                        }
                        message = stream.next() => message,
                    };
                    match message {
                        Some(FeedMessage::Subscribed) => {
                            debug!("change feed 已订阅，补齐增量: user={}", user_id);
                            if let Err(e) = self.orchestrator.pull_all(user_id).await {
                                if e.is_storage_failure() {
                                    return Err(e);
                                }
                                warn!("订阅后补齐失败: {}", e);
                            }
                        }
                        Some(FeedMessage::Change(event)) => {
                            if let Err(e) = self.apply_event(user_id, event).await {
                                if e.is_storage_failure() {
                                    return Err(e);
                                }
                                warn!("应用 feed 事件失败: {}", e);
                            }
                        }
                        Some(FeedMessage::Closed { reason }) => {
                            info!("change feed 断开: {}，{:?} 后重连", reason, self.reconnect_delay);
                            break;
                        }
                        None => {
                            info!("change feed 结束，{:?} 后重连", self.reconnect_delay);
                            break;
                        }
                    }
                },
                Err(e) => {
                    warn!("订阅 change feed 失败: {}，{:?} 后重试", e, self.reconnect_delay);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("change feed 已停止: user={}", user_id);
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, user_id: String, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let result = self.run(&user_id, cancel).await;
            if let Err(e) = &result {
                warn!("change feed 异常退出: {}", e);
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::events::SyncEvent;
    use crate::remote::InMemoryChangeFeed;
    use crate::sync::orchestrator::test_support::*;
    use serde_json::{json, Value};

    fn row(value: Value) -> crate::remote::Row {
        value.as_object().cloned().unwrap()
    }

    fn event(table: &str, event_type: OpKind, old: Option<Value>, new: Option<Value>) -> ChangeEvent {
        ChangeEvent {
            table: table.to_string(),
            event_type,
            old: old.map(row),
            new: new.map(row),
        }
    }

    fn bridge(fx: &Fixture, feed: &InMemoryChangeFeed) -> Arc<ChangeFeedBridge> {
        Arc::new(ChangeFeedBridge::new(
            Arc::new(feed.clone()),
            fx.orchestrator.clone(),
            Duration::from_millis(10),
        ))
    }

    async fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("条件未在超时前满足");
    }

    async fn wait_for_record(fx: &Fixture, table: Table, id: &str) {
        for _ in 0..200 {
            if fx.store.get(table, &id.into()).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} {} 未写入本地库", table, id);
    }

    #[tokio::test]
    async fn applies_upserts_and_deletes_without_moving_watermark() {
        let fx = Fixture::new().await;
        let feed = InMemoryChangeFeed::new();
        let bridge = bridge(&fx, &feed);
        let mut events = fx.store.events().subscribe();

        let report = bridge
            .apply_event(
                USER,
                event(
                    "calendars",
                    OpKind::Insert,
                    None,
                    Some(json!({"id": "c1", "user_id": USER, "name": "Feed", "updated_at": "2026-02-01T00:00:00Z"})),
                ),
            )
            .await
            .unwrap();
        assert_eq!(report.upserted.len(), 1);
        assert_eq!(report.watermark, None);
        match events.recv().await.unwrap() {
            SyncEvent::RecordsChanged { origin, table, .. } => {
                assert_eq!(origin, ChangeOrigin::Feed);
                assert_eq!(table, Table::Calendar);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(fx.store.watermarks().get(Table::Calendar, USER).await.unwrap(), None);

        let report = bridge
            .apply_event(USER, event("calendars", OpKind::Delete, Some(json!({"id": "c1"})), None))
            .await
            .unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert!(fx.store.get(Table::Calendar, &"c1".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_records_with_pending_changes() {
        let fx = Fixture::new().await;
        let bridge = bridge(&fx, &InMemoryChangeFeed::new());
        fx.insert(Table::Persona, json!({"id": "p1", "name": "local"})).await;

        let report = bridge
            .apply_event(
                USER,
                event("personas", OpKind::Update, None, Some(json!({"id": "p1", "name": "remote"}))),
            )
            .await
            .unwrap();
        assert_eq!(report.skipped_pending, 1);
        let local = fx.store.get(Table::Persona, &"p1".into()).await.unwrap().unwrap();
        assert_eq!(local.get_str("name"), Some("local"));

        let report = bridge
            .apply_event(USER, event("personas", OpKind::Delete, Some(json!({"id": "p1"})), None))
            .await
            .unwrap();
        assert_eq!(report.skipped_pending, 1);
        assert!(fx.store.get(Table::Persona, &"p1".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ignores_unknown_tables_and_malformed_rows() {
        let fx = Fixture::new().await;
        let bridge = bridge(&fx, &InMemoryChangeFeed::new());
        let report = bridge
            .apply_event(USER, event("audit_log", OpKind::Insert, None, Some(json!({"id": 1}))))
            .await
            .unwrap();
        assert_eq!(report.changed(), 0);
        let report = bridge
            .apply_event(USER, event("calendars", OpKind::Insert, None, Some(json!({"name": "no id"}))))
            .await
            .unwrap();
        assert_eq!(report.changed(), 0);
    }

    /// 断线期间漏掉的变化在重连后由 pull 补齐
    #[tokio::test]
    async fn reconnect_triggers_catch_up_pull() {
        let fx = Fixture::new().await;
        let feed = InMemoryChangeFeed::new();
        feed.fail_next_subscribe(RemoteError::transport("connection refused"));
        let cancel = CancellationToken::new();
        let handle = bridge(&fx, &feed).spawn(USER.to_string(), cancel.clone());

        wait_for(|| feed.subscriber_count() == 1).await;
        feed.publish(
            USER,
            event("calendars", OpKind::Insert, None, Some(json!({"id": "c1", "user_id": USER}))),
        );
        wait_for_record(&fx, Table::Calendar, "c1").await;

        // 断线期间服务端写入的行，没有对应的 feed 事件
        fx.remote_row("calendars", json!({"id": "c2"}));
        feed.disconnect_all("connection reset");
        wait_for_record(&fx, Table::Calendar, "c2").await;
        assert_eq!(feed.subscriptions(), 2);
        assert!(fx.store.watermarks().get(Table::Calendar, USER).await.unwrap().is_some());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
