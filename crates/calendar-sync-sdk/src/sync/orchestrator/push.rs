//! push：排空 outbox
//!
//! 1. 跨实例锁下读取到期操作（created_at 顺序），按 (table, record_key) 去重
//! 2. 按 (table, op) 分组，组按表依赖顺序处理；未登记表排最后
//! 3. insert/update 组批量 upsert，delete 组批量删除（限定用户）；组合资源逐条发送，
//!    用响应刷新本地库
//! 4. 成功确认；失败按分类退避、挂起或视为成功。失败组不影响无依赖关系的后续组

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::SyncOrchestrator;
use crate::error::{RemoteError, Result};
use crate::events::{event_builders, ChangeOrigin};
use crate::remote::{CompositeMethod, Row};
use crate::schema::{key_columns_of, push_rank_of, RecordKey, Table};
use crate::storage::entities::{merge_fields, OpKind, OutboxOperation, RemoteChange};
use crate::storage::PushFailureKind;

/// 一次 push 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// 远端确认后删除的操作
    pub acknowledged: usize,
    /// 远端已存在（409 / 23505），按成功删除
    pub duplicates: usize,
    pub retried: usize,
    pub parked: usize,
    /// 依赖的表本轮失败，留待下次
    pub deferred: usize,
    /// 组合端点响应刷新的本地记录数
    pub refreshed: usize,
    pub failed_tables: Vec<String>,
}

impl PushReport {
    pub fn is_clean(&self) -> bool {
        self.failed_tables.is_empty() && self.deferred == 0
    }
}

#[derive(Debug)]
struct OperationGroup {
    table: String,
    table_ref: Option<Table>,
    op: OpKind,
    operations: Vec<OutboxOperation>,
}

/// 同一 (table, record_key) 只保留最后一条
fn dedupe_latest(operations: Vec<OutboxOperation>) -> Vec<OutboxOperation> {
    let mut positions: HashMap<(String, RecordKey), usize> = HashMap::new();
    let mut kept: Vec<Option<OutboxOperation>> = Vec::with_capacity(operations.len());
    for operation in operations {
        let slot = (operation.table.clone(), operation.record_key.clone());
        if let Some(previous) = positions.insert(slot, kept.len()) {
            warn!(
                "outbox 中同一记录存在多条操作，保留最新: table={}, key={}",
                operation.table, operation.record_key
            );
            kept[previous] = None;
        }
        kept.push(Some(operation));
    }
    kept.into_iter().flatten().collect()
}

/// 按 (依赖顺序, 表, op) 分组；组内保持 created_at 顺序
fn group_operations(operations: Vec<OutboxOperation>) -> Vec<OperationGroup> {
    let mut groups: BTreeMap<(u8, String, OpKind), Vec<OutboxOperation>> = BTreeMap::new();
    for operation in operations {
        groups
            .entry((push_rank_of(&operation.table), operation.table.clone(), operation.op))
            .or_default()
            .push(operation);
    }
    groups
        .into_iter()
        .map(|((_, table, op), operations)| OperationGroup {
            table_ref: Table::from_str(&table).ok(),
            table,
            op,
            operations,
        })
        .collect()
}

/// 发往远端的行：主键列 + payload
fn outgoing_row(table: &str, operation: &OutboxOperation) -> Row {
    let mut row = operation.record_key.to_fields(key_columns_of(table));
    merge_fields(&mut row, &operation.payload);
    row
}

/// 组合端点响应 → 按表分组的行
///
/// 响应可以是以表名为键的对象（值为数组或单行），也可以是被推送表的单行/多行。
fn composite_rows(pushed: Table, response: Value) -> Vec<(Table, Vec<Row>)> {
    fn rows_of(value: Value) -> Vec<Row> {
        match value {
            Value::Object(row) => vec![row],
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    match response {
        Value::Object(map) => {
            let keyed = map
                .get(pushed.as_str())
                .map_or(false, |v| v.is_object() || v.is_array())
                || map.keys().all(|k| Table::from_str(k).is_ok());
            if !keyed {
                return vec![(pushed, vec![map])];
            }
            let mut grouped: BTreeMap<Table, Vec<Row>> = BTreeMap::new();
            for (name, value) in map {
                if let Ok(table) = Table::from_str(&name) {
                    grouped.entry(table).or_default().extend(rows_of(value));
                }
            }
            grouped.into_iter().collect()
        }
        array @ Value::Array(_) => vec![(pushed, rows_of(array))],
        _ => Vec::new(),
    }
}

impl SyncOrchestrator {
    /// 排空该用户的 outbox
    #[instrument(skip(self))]
    pub async fn push(&self, user_id: &str) -> Result<PushReport> {
        self.set_syncing(true);
        let result = self
            .coordinator
            .with_exclusive_access(&self.lock_name, || self.drain(user_id))
            .await;
        match &result {
            Ok(report) => {
                let now = self.store.clock().now();
                let recovered = report.failed_tables.is_empty()
                    && report.acknowledged + report.duplicates > 0;
                self.update_status(|status| {
                    status.last_push_at = Some(now);
                    if recovered {
                        status.last_error = None;
                    }
                });
            }
            Err(e) => {
                error!("push 失败: user={}, error={}", user_id, e);
                let message = e.to_string();
                self.update_status(|status| status.last_error = Some(message));
            }
        }
        self.finish(user_id).await;
        result
    }

    async fn drain(&self, user_id: &str) -> Result<PushReport> {
        let due = self.store.outbox().due(user_id).await?;
        let mut report = PushReport::default();
        if due.is_empty() {
            debug!("outbox 无到期操作: user={}", user_id);
            return Ok(report);
        }

        let groups = group_operations(dedupe_latest(due));
        info!("开始推送: user={}, groups={}", user_id, groups.len());
        let mut failed: HashSet<String> = HashSet::new();

        for group in groups {
            if let Some(blocker) = blocked_by(&group, &failed) {
                debug!(
                    "{} 依赖的 {} 本轮失败，推迟 {} 条 {} 操作",
                    group.table,
                    blocker,
                    group.operations.len(),
                    group.op
                );
                report.deferred += group.operations.len();
                continue;
            }
            if group.table_ref.is_none() {
                warn!("未登记的表 {}，最后推送", group.table);
            }

            let succeeded = match group.table_ref.and_then(|t| t.composite_route().map(|r| (t, r))) {
                Some((table, route)) => {
                    self.push_composite(user_id, table, route, &group, &mut report)
                        .await?
                }
                None => self.push_batch(user_id, &group, &mut report).await?,
            };
            if !succeeded {
                failed.insert(group.table.clone());
            }
        }

        let mut failed_tables: Vec<String> = failed.into_iter().collect();
        failed_tables.sort();
        report.failed_tables = failed_tables;
        info!(
            "推送完成: user={}, acknowledged={}, duplicates={}, retried={}, parked={}, deferred={}",
            user_id,
            report.acknowledged,
            report.duplicates,
            report.retried,
            report.parked,
            report.deferred
        );
        Ok(report)
    }

    async fn push_batch(
        &self,
        user_id: &str,
        group: &OperationGroup,
        report: &mut PushReport,
    ) -> Result<bool> {
        let key_columns = key_columns_of(&group.table);
        debug!(
            "推送 {} 条 {} -> {}",
            group.operations.len(),
            group.op,
            group.table
        );
        let operations = self.store.outbox().mark_dispatched(&group.operations).await?;
        if operations.is_empty() {
            debug!("{} {} 操作在发送前已被取消", group.table, group.op);
            return Ok(true);
        }
        let outcome = match group.op {
            OpKind::Delete => {
                let owner_column = group.table_ref.map_or("user_id", Table::owner_column);
                let keys = operations.iter().map(|op| op.record_key.clone()).collect();
                self.remote
                    .delete(&group.table, key_columns, keys, owner_column, user_id)
                    .await
            }
            OpKind::Insert | OpKind::Update => {
                let rows = operations
                    .iter()
                    .map(|op| outgoing_row(&group.table, op))
                    .collect();
                self.remote
                    .upsert(&group.table, key_columns, rows)
                    .await
                    .map(|_| ())
            }
        };

        match outcome {
            Ok(()) => {
                report.acknowledged += self.store.outbox().acknowledge(&operations).await?;
                Ok(true)
            }
            Err(error) => {
                self.handle_failure(&group.table, group.op, &operations, error, report)
                    .await
            }
        }
    }

    /// 组合资源逐条发送：暂时性失败中止本组剩余操作；永久失败只挂起当前操作
    async fn push_composite(
        &self,
        user_id: &str,
        table: Table,
        route: &str,
        group: &OperationGroup,
        report: &mut PushReport,
    ) -> Result<bool> {
        let method = CompositeMethod::for_op(group.op);
        let mut succeeded = true;
        for queued in &group.operations {
            let Some(sent) = self
                .store
                .outbox()
                .mark_dispatched(std::slice::from_ref(queued))
                .await?
                .pop()
            else {
                debug!("{} {} 在发送前已被取消", group.table, queued.record_key);
                continue;
            };
            let operation = &sent;
            let payload = match group.op {
                OpKind::Delete => Row::new(),
                OpKind::Insert | OpKind::Update => outgoing_row(&group.table, operation),
            };
            match self
                .remote
                .composite(route, method, &operation.record_key, payload)
                .await
            {
                Ok(response) => {
                    report.acknowledged += self
                        .store
                        .outbox()
                        .acknowledge(std::slice::from_ref(operation))
                        .await?;
                    report.refreshed += self
                        .apply_composite_response(user_id, table, response)
                        .await?;
                }
                Err(error) => {
                    let kind = PushFailureKind::classify(&error);
                    let handled = self
                        .handle_failure(
                            &group.table,
                            group.op,
                            std::slice::from_ref(operation),
                            error,
                            report,
                        )
                        .await?;
                    if !handled {
                        succeeded = false;
                    }
                    if kind == PushFailureKind::Transient {
                        break;
                    }
                }
            }
        }
        Ok(succeeded)
    }

    async fn apply_composite_response(
        &self,
        user_id: &str,
        pushed: Table,
        response: Value,
    ) -> Result<usize> {
        let mut refreshed = 0;
        for (table, rows) in composite_rows(pushed, response) {
            let changes: Vec<RemoteChange> = rows
                .into_iter()
                .filter_map(|row| match RemoteChange::from_row(table, row) {
                    Ok(change) => Some(change),
                    Err(e) => {
                        warn!("忽略组合响应中的无效行: table={}, error={}", table, e);
                        None
                    }
                })
                .collect();
            if changes.is_empty() {
                continue;
            }
            let applied = self
                .store
                .apply_remote(user_id, table, changes, ChangeOrigin::Composite)
                .await?;
            refreshed += applied.changed();
        }
        Ok(refreshed)
    }

    /// 返回 true 表示按成功处理（重复键）
    async fn handle_failure(
        &self,
        table: &str,
        op: OpKind,
        operations: &[OutboxOperation],
        error: RemoteError,
        report: &mut PushReport,
    ) -> Result<bool> {
        let outbox = self.store.outbox();
        let kind = PushFailureKind::classify(&error);
        match kind {
            PushFailureKind::Duplicate => {
                info!(
                    "远端已存在 {} 条 {} 记录，视为成功: {}",
                    operations.len(),
                    table,
                    error
                );
                report.duplicates += outbox.acknowledge(operations).await?;
                return Ok(true);
            }
            PushFailureKind::Transient => {
                let retries = outbox.schedule_retry(operations, &self.retry_policy).await?;
                report.retried += operations.len();
                if let Some(next) = retries.iter().map(|r| r.next_attempt_at).min() {
                    warn!(
                        "推送 {} {} 暂时失败，稍后重试: next_attempt_at={}, error={}",
                        table, op, next, error
                    );
                }
            }
            PushFailureKind::Permanent => {
                report.parked += outbox.park(operations, &error.label()).await?;
                error!(
                    "推送 {} {} 永久失败，已挂起 {} 条: {}",
                    table,
                    op,
                    operations.len(),
                    error
                );
            }
        }

        let message = error.to_string();
        self.update_status(|status| status.last_error = Some(message.clone()));
        self.store
            .events()
            .emit(event_builders::push_failed(
                table,
                op,
                kind,
                message,
                operations.iter().map(|o| o.id.clone()).collect(),
            ))
            .await;
        Ok(false)
    }
}

/// 组所在表（传递地）依赖本轮失败的表时返回该表名
fn blocked_by(group: &OperationGroup, failed: &HashSet<String>) -> Option<String> {
    let table = group.table_ref?;
    failed
        .iter()
        .find(|name| {
            Table::from_str(name).map_or(false, |failed_table| table.depends_transitively_on(failed_table))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;
    use crate::remote::RemoteCallKind;
    use crate::sync::orchestrator::test_support::*;
    use crate::utils::time::Clock;
    use chrono::TimeZone;
    use serde_json::json;

    fn operation(table: &str, key: &str, op: OpKind, created: i64) -> OutboxOperation {
        OutboxOperation {
            id: format!("{}-{}", table, key),
            user_id: "u1".to_string(),
            table: table.to_string(),
            record_key: RecordKey::single(key),
            op,
            payload: Row::new(),
            created_at: chrono::Utc.timestamp_opt(created, 0).unwrap(),
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            revision: 0,
            dispatched: false,
        }
    }

    #[test]
    fn groups_follow_dependency_order() {
        let groups = group_operations(vec![
            operation("event_responses", "r", OpKind::Insert, 1),
            operation("legacy_notes", "n", OpKind::Insert, 2),
            operation("events", "e", OpKind::Update, 3),
            operation("profiles", "p", OpKind::Update, 4),
            operation("events", "e2", OpKind::Insert, 5),
            operation("calendars", "c", OpKind::Delete, 6),
        ]);
        let order: Vec<(String, OpKind)> = groups
            .iter()
            .map(|g| (g.table.clone(), g.op))
            .collect();
        assert_eq!(
            order,
            vec![
                ("profiles".to_string(), OpKind::Update),
                ("calendars".to_string(), OpKind::Delete),
                ("events".to_string(), OpKind::Insert),
                ("events".to_string(), OpKind::Update),
                ("event_responses".to_string(), OpKind::Insert),
                ("legacy_notes".to_string(), OpKind::Insert),
            ]
        );
    }

    #[test]
    fn dedupe_keeps_latest() {
        let ops = dedupe_latest(vec![
            operation("events", "e", OpKind::Insert, 1),
            operation("events", "f", OpKind::Insert, 2),
            operation("events", "e", OpKind::Update, 3),
        ]);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].record_key, RecordKey::single("f"));
        assert_eq!(ops[1].op, OpKind::Update);
    }

    #[test]
    fn composite_response_shapes() {
        let keyed = composite_rows(
            Table::Event,
            json!({"events": [{"id": "e1"}], "event_details": {"event_id": "e1"}}),
        );
        assert_eq!(keyed.len(), 2);
        assert_eq!(keyed[0].0, Table::Event);
        assert_eq!(keyed[1].0, Table::EventDetail);
        assert_eq!(keyed[1].1.len(), 1);

        let single = composite_rows(
            Table::Event,
            json!({"id": "e1", "event_details": {"location": "x"}, "title": "t"}),
        );
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].1[0]["title"], "t");

        assert!(composite_rows(Table::Event, Value::Null).is_empty());
    }

    #[tokio::test]
    async fn push_acknowledges_and_sends_batches() {
        let fx = Fixture::new().await;
        fx.insert(Table::Calendar, json!({"id": "c1", "name": "Work"})).await;
        fx.insert(Table::Calendar, json!({"id": "c2", "name": "Home"})).await;
        fx.insert(Table::Category, json!({"id": "k1", "name": "Focus"})).await;

        let report = fx.orchestrator.push("u1").await.unwrap();
        assert_eq!(report.acknowledged, 3);
        assert!(report.is_clean());
        assert!(fx.store.outbox().list("u1").await.unwrap().is_empty());
        assert_eq!(fx.remote.rows("calendars").len(), 2);

        let upserts: Vec<_> = fx
            .remote
            .calls()
            .into_iter()
            .filter(|c| c.kind == RemoteCallKind::Upsert)
            .collect();
        assert_eq!(upserts.len(), 2, "每个 (table, op) 组一次批量调用");
        assert_eq!(upserts[0].table, "calendars");
        assert_eq!(upserts[0].keys.len(), 2);
    }

    #[tokio::test]
    async fn deletes_are_scoped_to_user() {
        let fx = Fixture::new().await;
        fx.insert(Table::Calendar, json!({"id": "c1"})).await;
        fx.orchestrator.push("u1").await.unwrap();
        fx.delete(Table::Calendar, "c1").await;
        fx.orchestrator.push("u1").await.unwrap();

        assert!(fx.remote.rows("calendars").is_empty());
        let delete = fx
            .remote
            .calls()
            .into_iter()
            .find(|c| c.kind == RemoteCallKind::Delete)
            .unwrap();
        assert_eq!(delete.keys, vec![RecordKey::single("c1")]);
    }

    #[tokio::test]
    async fn transient_failure_backs_off_and_retries() {
        let fx = Fixture::new().await;
        fx.insert(Table::Calendar, json!({"id": "c1"})).await;
        fx.remote
            .fail_next(Some("calendars"), RemoteError::http(500, "boom"), 3);
        let mut events = fx.store.events().subscribe_filtered(
            crate::events::EventFilter::new().with_event_types(vec!["push_failed".to_string()]),
        );

        let expected = [2_000i64, 4_000, 8_000];
        for (i, base) in expected.iter().enumerate() {
            let report = fx.orchestrator.push("u1").await.unwrap();
            assert_eq!(report.retried, 1);
            let ops = fx.store.outbox().list("u1").await.unwrap();
            assert_eq!(ops.len(), 1);
            assert_eq!(ops[0].attempts, (i + 1) as u32);
            let delay = (ops[0].next_attempt_at.unwrap() - fx.clock.now()).num_milliseconds();
            assert!((delay - base).abs() <= base / 10, "delay={} base={}", delay, base);

            // 退避未到期：不发送
            let idle = fx.orchestrator.push("u1").await.unwrap();
            assert_eq!(idle, PushReport::default());
            fx.clock.advance(chrono::Duration::milliseconds(delay));
        }
        match events.recv().await.unwrap() {
            SyncEvent::PushFailed { kind, table, .. } => {
                assert_eq!(kind, PushFailureKind::Transient);
                assert_eq!(table, "calendars");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(fx.orchestrator.status().last_error.is_some());

        let report = fx.orchestrator.push("u1").await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert!(fx.store.outbox().list("u1").await.unwrap().is_empty());
        assert_eq!(fx.orchestrator.status().last_error, None);
    }

    #[tokio::test]
    async fn permanent_failure_parks_operation() {
        let fx = Fixture::new().await;
        fx.insert(Table::Calendar, json!({"id": "c1"})).await;
        fx.remote
            .fail_next(Some("calendars"), RemoteError::http(401, "jwt expired"), 1);

        let report = fx.orchestrator.push("u1").await.unwrap();
        assert_eq!(report.parked, 1);
        for _ in 0..3 {
            fx.clock.advance(chrono::Duration::minutes(5));
            fx.orchestrator.push("u1").await.unwrap();
        }
        let ops = fx.store.outbox().list("u1").await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].last_error.as_deref(), Some("401"));
        assert_eq!(ops[0].attempts, 0);
        assert_eq!(fx.orchestrator.status().parked, 1);

        fx.store.outbox().retry_parked("u1").await.unwrap();
        let report = fx.orchestrator.push("u1").await.unwrap();
        assert_eq!(report.acknowledged, 1);
    }

    #[tokio::test]
    async fn duplicate_key_counts_as_success() {
        let fx = Fixture::new().await;
        fx.insert(Table::Persona, json!({"id": "p1"})).await;
        fx.remote.fail_next(
            Some("personas"),
            RemoteError::http(400, "duplicate key").with_code("23505"),
            1,
        );
        let report = fx.orchestrator.push("u1").await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert!(report.failed_tables.is_empty());
        assert!(fx.store.outbox().list("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_table_defers_only_dependents() {
        let fx = Fixture::new().await;
        fx.insert(Table::Calendar, json!({"id": "c1"})).await;
        fx.insert(Table::Persona, json!({"id": "p1"})).await;
        fx.insert(Table::EventParticipantRole, json!({"event_id": "e9", "persona_id": "p1"}))
            .await;
        fx.insert(Table::EventResponse, json!({"event_id": "e9", "user_id": "u1"}))
            .await;
        fx.remote
            .fail_next(Some("personas"), RemoteError::transport("connection reset"), 1);

        let report = fx.orchestrator.push("u1").await.unwrap();
        assert_eq!(report.failed_tables, vec!["personas".to_string()]);
        // calendars 与 event_responses 不依赖 personas
        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.deferred, 1);
        let left: Vec<String> = fx
            .store
            .outbox()
            .list("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.table)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&"personas".to_string()));
        assert!(left.contains(&"event_participant_roles".to_string()));
    }

    #[tokio::test]
    async fn composite_resource_refreshes_local_store() {
        let fx = Fixture::new().await;
        fx.insert(
            Table::Event,
            json!({"id": "e1", "title": "standup", "event_details": {"location": "room 1"}}),
        )
        .await;
        let mut changes = fx.store.events().subscribe_filtered(
            crate::events::EventFilter::new().with_origins(vec![ChangeOrigin::Composite]),
        );

        let report = fx.orchestrator.push("u1").await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.refreshed, 2);

        let detail = fx
            .store
            .get(Table::EventDetail, &"e1".into())
            .await
            .unwrap()
            .expect("组合端点返回的明细应写入本地");
        assert_eq!(detail.get_str("location"), Some("room 1"));
        let event = fx.store.get(Table::Event, &"e1".into()).await.unwrap().unwrap();
        assert!(event.get("event_details").is_none());
        assert!(matches!(
            changes.recv().await.unwrap(),
            SyncEvent::RecordsChanged { origin: ChangeOrigin::Composite, .. }
        ));

        let composite_calls = fx
            .remote
            .calls()
            .into_iter()
            .filter(|c| matches!(c.kind, RemoteCallKind::Composite(CompositeMethod::Post)))
            .count();
        assert_eq!(composite_calls, 1);
    }

    #[tokio::test]
    async fn composite_permanent_failure_does_not_block_siblings() {
        let fx = Fixture::new().await;
        fx.insert(Table::Event, json!({"id": "e1"})).await;
        fx.insert(Table::Event, json!({"id": "e2"})).await;
        fx.remote
            .fail_next(Some("events"), RemoteError::http(422, "invalid"), 1);
        let report = fx.orchestrator.push("u1").await.unwrap();
        assert_eq!(report.parked, 1);
        assert_eq!(report.acknowledged, 1);
        assert_eq!(fx.remote.rows("events").len(), 1);
    }

    #[tokio::test]
    async fn mutation_during_push_survives_ack() {
        let fx = Fixture::new().await;
        fx.insert(Table::Calendar, json!({"id": "c1", "name": "v1"})).await;
        fx.remote.set_latency(Some(std::time::Duration::from_millis(100)));

        let orchestrator = fx.orchestrator.clone();
        let push = tokio::spawn(async move { orchestrator.push("u1").await });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        fx.update(Table::Calendar, "c1", json!({"name": "v2"})).await;
        push.await.unwrap().unwrap();

        let ops = fx.store.outbox().list("u1").await.unwrap();
        assert_eq!(ops.len(), 1, "推送期间的修改必须保留");
        assert_eq!(ops[0].payload["name"], "v2");

        fx.remote.set_latency(None);
        fx.orchestrator.push("u1").await.unwrap();
        assert_eq!(fx.remote.rows("calendars")[0]["name"], "v2");
    }

    #[tokio::test]
    async fn delete_during_insert_push_reaches_remote() {
        let fx = Fixture::new().await;
        fx.insert(Table::Calendar, json!({"id": "c1", "name": "v1"})).await;
        fx.remote.set_latency(Some(std::time::Duration::from_millis(100)));

        let orchestrator = fx.orchestrator.clone();
        let push = tokio::spawn(async move { orchestrator.push("u1").await });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        fx.delete(Table::Calendar, "c1").await;
        push.await.unwrap().unwrap();

        let ops = fx.store.outbox().list("u1").await.unwrap();
        assert_eq!(ops.len(), 1, "insert 已发出，delete 必须保留");
        assert_eq!(ops[0].op, OpKind::Delete);

        fx.remote.set_latency(None);
        fx.orchestrator.sync("u1").await.unwrap();
        assert!(fx.remote.rows("calendars").is_empty());
        assert!(fx.store.get(Table::Calendar, &"c1".into()).await.unwrap().is_none());
    }
}
