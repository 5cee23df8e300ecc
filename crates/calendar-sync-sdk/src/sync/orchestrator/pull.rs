//! pull：按水位增量拉取
//!
//! `updated_at > watermark` 且属于该用户的行，按 (updated_at, 主键) 升序 keyset 分页读取。
//! 有待推送操作的记录、本地副本更新的记录跳过；水位推进到见过的最大 updated_at。

use tracing::{debug, info, instrument, warn};

use super::SyncOrchestrator;
use crate::error::{CalendarSyncError, RemoteError, Result};
use crate::events::ChangeOrigin;
use crate::remote::SelectQuery;
use crate::schema::{RecordKey, Table};
use crate::storage::entities::{ApplyReport, RemoteChange};
use crate::utils::time::timestamp_from_json;

/// 全部表拉取的汇总；远端失败的表记录在 `failed` 中，不影响其他表
#[derive(Debug, Clone, Default)]
pub struct PullSummary {
    pub tables: Vec<(Table, ApplyReport)>,
    pub failed: Vec<(Table, RemoteError)>,
}

impl PullSummary {
    pub fn changed(&self) -> usize {
        self.tables.iter().map(|(_, report)| report.changed()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn report(&self, table: Table) -> Option<&ApplyReport> {
        self.tables
            .iter()
            .find(|(t, _)| *t == table)
            .map(|(_, report)| report)
    }
}

fn merge_report(total: &mut ApplyReport, page: ApplyReport) {
    total.upserted.extend(page.upserted);
    total.deleted.extend(page.deleted);
    total.skipped_pending += page.skipped_pending;
    total.skipped_stale += page.skipped_stale;
    if page.watermark.is_some() {
        total.watermark = page.watermark;
    }
}

impl SyncOrchestrator {
    /// 拉取单张表
    #[instrument(skip(self))]
    pub async fn pull(&self, table: Table, user_id: &str) -> Result<ApplyReport> {
        let result = self.pull_table(table, user_id).await;
        match &result {
            Ok(_) => {
                let now = self.store.clock().now();
                self.update_status(|status| status.last_pull_at = Some(now));
            }
            Err(e) => {
                let message = format!("pull {}: {}", table, e);
                self.update_status(|status| status.last_error = Some(message));
            }
        }
        result
    }

    /// 依次拉取全部表；单表远端失败只记录，存储错误立即上抛
    #[instrument(skip(self))]
    pub async fn pull_all(&self, user_id: &str) -> Result<PullSummary> {
        self.set_syncing(true);
        let mut summary = PullSummary::default();
        for table in Table::ALL {
            match self.pull_table(table, user_id).await {
                Ok(report) => summary.tables.push((table, report)),
                Err(CalendarSyncError::Remote(error)) => {
                    warn!("拉取 {} 失败: {}", table, error);
                    summary.failed.push((table, error));
                }
                Err(e) => {
                    let message = e.to_string();
                    self.update_status(|status| status.last_error = Some(message));
                    self.finish(user_id).await;
                    return Err(e);
                }
            }
        }

        let now = self.store.clock().now();
        let failure = summary
            .failed
            .first()
            .map(|(table, error)| format!("pull {}: {}", table, error));
        self.update_status(|status| {
            status.last_pull_at = Some(now);
            if let Some(failure) = failure {
                status.last_error = Some(failure);
            }
        });
        info!(
            "拉取完成: user={}, changed={}, failed_tables={}",
            user_id,
            summary.changed(),
            summary.failed.len()
        );
        self.finish(user_id).await;
        Ok(summary)
    }

    async fn pull_table(&self, table: Table, user_id: &str) -> Result<ApplyReport> {
        let since = self.store.watermarks().get(table, user_id).await?;
        let mut total = ApplyReport {
            watermark: since,
            ..ApplyReport::default()
        };
        let mut query = SelectQuery {
            owner_column: table.owner_column().to_string(),
            key_columns: table.key_columns().iter().map(|c| c.to_string()).collect(),
            user_id: user_id.to_string(),
            since,
            after: None,
            limit: self.page_size,
        };

        loop {
            let rows = self.remote.select(table.as_str(), &query).await?;
            let fetched = rows.len();
            let cursor = rows.last().map(|row| {
                (
                    row.get("updated_at").and_then(timestamp_from_json),
                    RecordKey::from_row(table.key_columns(), row),
                )
            });
            let newest = rows
                .iter()
                .filter_map(|row| row.get("updated_at").and_then(timestamp_from_json))
                .max();

            let mut invalid = 0;
            let changes: Vec<RemoteChange> = rows
                .into_iter()
                .filter_map(|row| match RemoteChange::from_row(table, row) {
                    Ok(change) => Some(change),
                    Err(e) => {
                        warn!("忽略无效的远端行: table={}, error={}", table, e);
                        invalid += 1;
                        None
                    }
                })
                .collect();

            if !changes.is_empty() {
                let page = self
                    .store
                    .apply_remote(user_id, table, changes, ChangeOrigin::Pull)
                    .await?;
                merge_report(&mut total, page);
            }
            // 无效行同样算作“见过”
            if invalid > 0 {
                if let Some(newest) = newest {
                    total.watermark =
                        Some(self.store.watermarks().advance(table, user_id, newest).await?);
                }
            }

            if fetched < self.page_size {
                break;
            }
            // 下一页从本页最后一行 (updated_at, 主键) 之后开始
            match cursor {
                Some((Some(updated_at), Some(key)))
                    if query.since != Some(updated_at) || query.after.as_ref() != Some(&key) =>
                {
                    query.since = Some(updated_at);
                    query.after = Some(key);
                }
                _ => {
                    warn!("拉取 {}: 本页末行无法作为游标，停止分页", table);
                    break;
                }
            }
        }

        debug!(
            "拉取 {}: upserted={}, deleted={}, skipped_pending={}, skipped_stale={}, watermark={:?}",
            table,
            total.upserted.len(),
            total.deleted.len(),
            total.skipped_pending,
            total.skipped_stale,
            total.watermark
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;
    use crate::schema::RecordKey;
    use crate::remote::{CompositeMethod, InMemoryRemote, RemoteResult, RemoteService, Row};
    use crate::sync::orchestrator::test_support::*;
    use crate::utils::time::{parse_iso, to_iso, Clock};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn pull_applies_rows_and_advances_watermark() {
        let fx = Fixture::new().await;
        fx.remote_row("calendars", json!({"id": "c1", "name": "Work"}));
        fx.remote_row("calendars", json!({"id": "c2", "name": "Home"}));
        let newest = fx.clock.now();
        fx.remote_row("calendars", json!({"id": "other", "user_id": "u2"}));

        let report = fx.orchestrator.pull(Table::Calendar, USER).await.unwrap();
        assert_eq!(report.upserted.len(), 2);
        assert_eq!(report.watermark, Some(newest));
        assert_eq!(
            fx.store.watermarks().get(Table::Calendar, USER).await.unwrap(),
            Some(newest)
        );
        let local = fx.store.get(Table::Calendar, &"c1".into()).await.unwrap().unwrap();
        assert_eq!(local.get_str("name"), Some("Work"));
        assert!(fx.store.get(Table::Calendar, &"other".into()).await.unwrap().is_none());

        // 再次拉取：水位之后无新行
        let again = fx.orchestrator.pull(Table::Calendar, USER).await.unwrap();
        assert_eq!(again.changed(), 0);
        assert_eq!(again.watermark, Some(newest));
    }

    #[tokio::test]
    async fn pending_local_change_takes_precedence() {
        let fx = Fixture::new().await;
        fx.insert(Table::Calendar, json!({"id": "c1", "name": "local"})).await;
        fx.remote_row("calendars", json!({"id": "c1", "name": "remote"}));

        let report = fx.orchestrator.pull(Table::Calendar, USER).await.unwrap();
        assert_eq!(report.skipped_pending, 1);
        let local = fx.store.get(Table::Calendar, &"c1".into()).await.unwrap().unwrap();
        assert_eq!(local.get_str("name"), Some("local"));
        // 跳过的行同样推进水位
        assert!(report.watermark.is_some());
    }

    #[tokio::test]
    async fn stale_remote_read_is_skipped() {
        let fx = Fixture::new().await;
        let old = to_iso(fx.clock.now() - chrono::Duration::minutes(10));
        fx.remote_row("personas", json!({"id": "p1", "name": "old", "updated_at": old}));
        fx.insert(Table::Persona, json!({"id": "p1", "name": "new"})).await;
        fx.orchestrator.push(USER).await.unwrap();
        // push 之后远端被旧值覆盖的读（读写竞争）
        fx.remote.seed(
            "personas",
            vec![json!({"id": "p1", "user_id": USER, "name": "old", "updated_at": old})
                .as_object()
                .cloned()
                .unwrap()],
        );

        let report = fx.orchestrator.pull(Table::Persona, USER).await.unwrap();
        assert_eq!(report.skipped_stale, 1);
        let local = fx.store.get(Table::Persona, &"p1".into()).await.unwrap().unwrap();
        assert_eq!(local.get_str("name"), Some("new"));
        assert_eq!(report.watermark, parse_iso(&old));
    }

    #[tokio::test]
    async fn watermark_never_decreases() {
        let fx = Fixture::new().await;
        fx.remote_row("categories", json!({"id": "k1"}));
        let first = fx.orchestrator.pull(Table::Category, USER).await.unwrap().watermark;

        // 更早的行（时钟回拨的设备）不会让水位倒退
        let earlier = to_iso(fx.clock.now() - chrono::Duration::hours(1));
        fx.remote_row("categories", json!({"id": "k0", "updated_at": earlier}));
        let second = fx.orchestrator.pull(Table::Category, USER).await.unwrap().watermark;
        assert_eq!(first, second);
        assert!(fx.store.get(Table::Category, &"k0".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tombstones_delete_local_rows() {
        let fx = Fixture::new().await;
        fx.remote_row("annotations", json!({"id": "a1"}));
        fx.orchestrator.pull(Table::Annotation, USER).await.unwrap();
        assert!(fx.store.get(Table::Annotation, &"a1".into()).await.unwrap().is_some());

        let mut feed = fx.store.events().subscribe();
        fx.remote_row("annotations", json!({"id": "a1", "deleted_at": "2026-02-02T00:00:00Z"}));
        let report = fx.orchestrator.pull(Table::Annotation, USER).await.unwrap();
        assert_eq!(report.deleted, vec![RecordKey::single("a1")]);
        assert!(fx.store.get(Table::Annotation, &"a1".into()).await.unwrap().is_none());
        loop {
            if let SyncEvent::RecordsChanged { origin, .. } = feed.recv().await.unwrap() {
                assert_eq!(origin, ChangeOrigin::Pull);
                break;
            }
        }
    }

    #[tokio::test]
    async fn pages_until_short_page() {
        let fx = Fixture::with_config(|config| config.remote.page_size = 2).await;
        for i in 0..5 {
            fx.remote_row("work_periods", json!({"id": format!("w{}", i), "weekday": i}));
        }
        let report = fx.orchestrator.pull(Table::WorkPeriod, USER).await.unwrap();
        assert_eq!(report.upserted.len(), 5);
        assert_eq!(fx.store.list(Table::WorkPeriod).await.unwrap().len(), 5);
        let selects = fx
            .remote
            .calls()
            .iter()
            .filter(|c| c.table == "work_periods")
            .count();
        assert_eq!(selects, 3);
    }

    /// 第一次 select 之后把一行移到更新的 updated_at（另一台设备在分页期间写入）
    struct ShiftingRemote {
        inner: Arc<InMemoryRemote>,
        shift: parking_lot::Mutex<Option<(String, Row)>>,
    }

    #[async_trait]
    impl RemoteService for ShiftingRemote {
        async fn upsert(&self, table: &str, key_columns: &[&str], rows: Vec<Row>) -> RemoteResult<Vec<Row>> {
            self.inner.upsert(table, key_columns, rows).await
        }

        async fn delete(
            &self,
            table: &str,
            key_columns: &[&str],
            keys: Vec<RecordKey>,
            owner_column: &str,
            user_id: &str,
        ) -> RemoteResult<()> {
            self.inner.delete(table, key_columns, keys, owner_column, user_id).await
        }

        async fn select(&self, table: &str, query: &SelectQuery) -> RemoteResult<Vec<Row>> {
            let rows = self.inner.select(table, query).await?;
            if let Some((table, row)) = self.shift.lock().take() {
                self.inner.seed(&table, vec![row]);
            }
            Ok(rows)
        }

        async fn composite(
            &self,
            route: &str,
            method: CompositeMethod,
            key: &RecordKey,
            payload: Row,
        ) -> RemoteResult<serde_json::Value> {
            self.inner.composite(route, method, key, payload).await
        }
    }

    #[tokio::test]
    async fn rows_moving_between_pages_are_not_skipped() {
        let fx = Fixture::new().await;
        for i in 0..4 {
            fx.remote_row("work_periods", json!({"id": format!("w{}", i), "weekday": i}));
        }
        let later = to_iso(fx.clock.now() + chrono::Duration::hours(1));
        let moved = json!({"id": "w0", "user_id": USER, "weekday": 7, "updated_at": later});
        let remote = ShiftingRemote {
            inner: fx.remote.clone(),
            shift: parking_lot::Mutex::new(Some((
                "work_periods".to_string(),
                moved.as_object().cloned().unwrap(),
            ))),
        };
        let mut config = test_config(fx.dir.path());
        config.remote.page_size = 2;
        let orchestrator = SyncOrchestrator::new(fx.store.clone(), Arc::new(remote), &config);

        let report = orchestrator.pull(Table::WorkPeriod, USER).await.unwrap();
        assert_eq!(fx.store.list(Table::WorkPeriod).await.unwrap().len(), 4);
        assert!(fx.store.get(Table::WorkPeriod, &"w2".into()).await.unwrap().is_some());
        let w0 = fx.store.get(Table::WorkPeriod, &"w0".into()).await.unwrap().unwrap();
        assert_eq!(w0.data["weekday"], 7);
        assert_eq!(report.watermark, parse_iso(&later));
    }

    #[tokio::test]
    async fn equal_timestamps_across_page_boundary() {
        let fx = Fixture::with_config(|config| config.remote.page_size = 2).await;
        let ts = to_iso(fx.clock.now());
        for id in ["k3", "k1", "k2", "k4", "k5"] {
            fx.remote_row("categories", json!({"id": id, "updated_at": ts}));
        }
        let report = fx.orchestrator.pull(Table::Category, USER).await.unwrap();
        assert_eq!(report.upserted.len(), 5);
        assert_eq!(fx.store.list(Table::Category).await.unwrap().len(), 5);
        assert_eq!(report.watermark, parse_iso(&ts));
    }

    #[tokio::test]
    async fn pull_all_continues_after_remote_failure() {
        let fx = Fixture::new().await;
        fx.remote_row("calendars", json!({"id": "c1"}));
        fx.remote_row("events", json!({"id": "e1"}));
        fx.remote
            .fail_next(Some("calendars"), RemoteError::http(503, "unavailable"), 1);

        let summary = fx.orchestrator.pull_all(USER).await.unwrap();
        assert!(!summary.is_complete());
        assert_eq!(summary.failed[0].0, Table::Calendar);
        assert_eq!(summary.report(Table::Event).unwrap().upserted.len(), 1);
        assert!(fx.orchestrator.status().last_error.is_some());
        assert!(fx.orchestrator.status().last_pull_at.is_some());

        let summary = fx.orchestrator.pull_all(USER).await.unwrap();
        assert!(summary.is_complete());
        assert!(fx.store.get(Table::Calendar, &"c1".into()).await.unwrap().is_some());
    }

    /// 无新的本地修改时，反复 push + pull 收敛：outbox 为空，本地与远端一致
    #[tokio::test]
    async fn push_pull_cycles_converge() {
        let fx = Fixture::new().await;
        fx.insert(Table::Calendar, json!({"id": "c1", "name": "Work"})).await;
        fx.insert(Table::Event, json!({"id": "e1", "calendar_id": "c1", "title": "Plan"}))
            .await;
        fx.update(Table::Calendar, "c1", json!({"name": "Work 2"})).await;
        fx.remote_row("categories", json!({"id": "k1", "name": "Remote"}));
        fx.remote
            .fail_next(Some("calendars"), RemoteError::http(502, "bad gateway"), 1);

        for _ in 0..4 {
            fx.orchestrator.sync(USER).await.unwrap();
            fx.clock.advance(chrono::Duration::seconds(60));
        }

        assert!(fx.store.outbox().list(USER).await.unwrap().is_empty());
        for table in [Table::Calendar, Table::Category, Table::Event] {
            let mut local: Vec<_> = fx
                .store
                .list(table)
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.data)
                .collect();
            let mut remote = fx.remote.rows(table.as_str());
            local.sort_by(|a, b| a["id"].to_string().cmp(&b["id"].to_string()));
            remote.sort_by(|a, b| a["id"].to_string().cmp(&b["id"].to_string()));
            assert_eq!(local, remote, "{} 未收敛", table);
        }
    }

    /// 两个实例共享同一文件并同时 push：每条操作只被远端接收一次
    #[tokio::test]
    async fn concurrent_instances_push_each_operation_once() {
        let fx = Fixture::new().await;
        let (_other_store, other) = fx.second_instance().await;
        fx.remote.set_latency(Some(std::time::Duration::from_millis(20)));
        for i in 0..5 {
            fx.insert(Table::Calendar, json!({"id": format!("c{}", i)})).await;
        }

        let a = fx.orchestrator.clone();
        let b = other.clone();
        let (left, right) = tokio::join!(
            tokio::spawn(async move { a.push(USER).await }),
            tokio::spawn(async move { b.push(USER).await })
        );
        let left = left.unwrap().unwrap();
        let right = right.unwrap().unwrap();
        assert_eq!(left.acknowledged + right.acknowledged, 5);

        for i in 0..5 {
            let key = RecordKey::single(format!("c{}", i));
            assert_eq!(fx.remote.received("calendars", &key), 1);
        }
        assert!(fx.store.outbox().list(USER).await.unwrap().is_empty());
    }
}
