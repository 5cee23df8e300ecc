//! Outbox DAO - 待推送操作日志
//!
//! 入队时按 `(user_id, table, record_key)` 合并，保证每条记录至多一条活动操作。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{CalendarSyncError, Result};
use crate::schema::RecordKey;
use crate::storage::entities::{
    merge_fields, EnqueueOutcome, OpKind, OutboxAck, OutboxCounts, OutboxOperation, OutboxRetry,
};
use crate::utils::time::{parse_iso, to_iso};

const COLUMNS: &str = "id, user_id, table_name, record_key, op, payload, created_at, attempts, last_error, next_attempt_at, revision, dispatched";

/// 一次入队请求
#[derive(Debug, Clone)]
pub struct NewOperation<'r> {
    pub id: String,
    pub user_id: &'r str,
    pub table: &'r str,
    pub record_key: &'r RecordKey,
    pub op: OpKind,
    pub payload: Map<String, Value>,
    pub now: DateTime<Utc>,
}

pub struct OutboxDao<'a> {
    conn: &'a Connection,
}

impl<'a> OutboxDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 合并入队
    ///
    /// - delete 遇到未发出的 insert：记录从未到达远端，删除全部操作，不产生任何操作
    /// - delete 其他情况（含已发出的 insert）：删除已有操作，追加 delete
    /// - update/insert 遇到 insert/update：字段级后写覆盖，attempts 归零，刷新 created_at
    /// - update/insert 遇到 delete：替换 delete（insert 视为可能已存在于远端）
    /// - 同一记录的多余操作（历史遗留重复）一律裁剪
    pub fn enqueue(&self, new: NewOperation<'_>) -> Result<EnqueueOutcome> {
        let mut existing = self.live_for(new.user_id, new.table, new.record_key)?;
        let current = if existing.is_empty() {
            None
        } else {
            Some(existing.remove(0))
        };
        for duplicate in &existing {
            warn!(
                "裁剪重复 outbox 操作: table={}, key={}, id={}",
                duplicate.table, duplicate.record_key, duplicate.id
            );
            self.delete_by_id(&duplicate.id)?;
        }

        let Some(current) = current else {
            self.insert_row(&new)?;
            return Ok(EnqueueOutcome::Appended { id: new.id });
        };

        match (new.op, current.op) {
            (OpKind::Delete, OpKind::Insert) if !current.dispatched => {
                self.delete_by_id(&current.id)?;
                debug!(
                    "insert 后 delete，取消操作: table={}, key={}",
                    new.table, new.record_key
                );
                Ok(EnqueueOutcome::Cancelled)
            }
            (OpKind::Delete, _) | (OpKind::Update | OpKind::Insert, OpKind::Delete) => {
                self.delete_by_id(&current.id)?;
                self.insert_row(&new)?;
                if new.op == OpKind::Insert {
                    // 被删除的记录可能仍在远端，之后的 delete 不能直接取消
                    self.mark_dispatched(std::slice::from_ref(&new.id))?;
                }
                debug!(
                    "{} 替换 {}: table={}, key={}",
                    new.op, current.op, new.table, new.record_key
                );
                Ok(EnqueueOutcome::Replaced { id: new.id })
            }
            (OpKind::Update | OpKind::Insert, OpKind::Insert | OpKind::Update) => {
                let mut payload = current.payload.clone();
                merge_fields(&mut payload, &new.payload);
                let op = if new.op == OpKind::Insert {
                    OpKind::Insert
                } else {
                    current.op
                };
                self.conn.execute(
                    "UPDATE outbox SET op = ?1, payload = ?2, attempts = 0, created_at = ?3,
                        next_attempt_at = NULL, revision = revision + 1
                     WHERE id = ?4",
                    params![
                        op.as_str(),
                        serde_json::to_string(&payload)?,
                        to_iso(new.now),
                        current.id
                    ],
                )?;
                debug!(
                    "合并 {} 到 {}: table={}, key={}, id={}",
                    new.op, op, new.table, new.record_key, current.id
                );
                Ok(EnqueueOutcome::Merged { id: current.id })
            }
        }
    }

    /// 某条记录的全部操作（含挂起），按 created_at 排序
    pub fn live_for(
        &self,
        user_id: &str,
        table: &str,
        record_key: &RecordKey,
    ) -> Result<Vec<OutboxOperation>> {
        self.select(
            "WHERE user_id = ?1 AND table_name = ?2 AND record_key = ?3 ORDER BY created_at, rowid",
            params![user_id, table, record_key.encode()],
        )
    }

    pub fn has_live(&self, user_id: &str, table: &str, record_key: &RecordKey) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE user_id = ?1 AND table_name = ?2 AND record_key = ?3",
            params![user_id, table, record_key.encode()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<OutboxOperation>> {
        let sql = format!("SELECT {} FROM outbox WHERE id = ?1", COLUMNS);
        self.conn
            .query_row(&sql, params![id], |row| raw_row(row))
            .optional()?
            .map(RawOperation::into_operation)
            .transpose()
    }

    /// 用户的全部操作（含挂起、未到期）
    pub fn list(&self, user_id: &str) -> Result<Vec<OutboxOperation>> {
        self.select(
            "WHERE user_id = ?1 ORDER BY created_at, rowid",
            params![user_id],
        )
    }

    /// 可推送的操作：未挂起且退避已到期
    pub fn due(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<OutboxOperation>> {
        self.select(
            "WHERE user_id = ?1 AND last_error IS NULL
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)
             ORDER BY created_at, rowid",
            params![user_id, to_iso(now)],
        )
    }

    /// 仅删除 revision 未变的行；返回实际删除数
    pub fn ack(&self, acks: &[OutboxAck]) -> Result<usize> {
        let mut removed = 0;
        for ack in acks {
            let affected = self.conn.execute(
                "DELETE FROM outbox WHERE id = ?1 AND revision = ?2",
                params![ack.id, ack.revision],
            )?;
            if affected == 0 {
                debug!("推送期间操作已被合并，保留: id={}", ack.id);
            }
            removed += affected;
        }
        Ok(removed)
    }

    /// 发往远端前标记（之后不再清除）；返回仍在队列中的 id
    pub fn mark_dispatched(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            let affected = self
                .conn
                .execute("UPDATE outbox SET dispatched = 1 WHERE id = ?1", params![id])?;
            if affected > 0 {
                live.push(id.clone());
            }
        }
        Ok(live)
    }

    pub fn record_retry(&self, retry: &OutboxRetry) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE outbox SET attempts = ?1, next_attempt_at = ?2 WHERE id = ?3 AND revision = ?4",
            params![
                retry.attempts,
                to_iso(retry.next_attempt_at),
                retry.id,
                retry.revision
            ],
        )?;
        Ok(affected > 0)
    }

    /// 永久失败：写入 last_error，不再自动重试
    pub fn park(&self, ack: &OutboxAck, error: &str) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE outbox SET last_error = ?1, next_attempt_at = NULL WHERE id = ?2 AND revision = ?3",
            params![error, ack.id, ack.revision],
        )?;
        Ok(affected > 0)
    }

    /// 外部干预后恢复挂起操作
    pub fn retry_parked(&self, user_id: &str) -> Result<usize> {
        let affected = self.conn.execute(
            "UPDATE outbox SET last_error = NULL, attempts = 0, next_attempt_at = NULL
             WHERE user_id = ?1 AND last_error IS NOT NULL",
            params![user_id],
        )?;
        Ok(affected)
    }

    pub fn counts(&self, user_id: &str) -> Result<OutboxCounts> {
        let (pending, parked, next_due): (i64, i64, Option<String>) = self.conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN last_error IS NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN last_error IS NOT NULL THEN 1 ELSE 0 END), 0),
                MIN(CASE WHEN last_error IS NULL THEN next_attempt_at END)
             FROM outbox WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(OutboxCounts {
            pending: pending as usize,
            parked: parked as usize,
            next_due_at: next_due.as_deref().and_then(parse_iso),
        })
    }

    fn delete_by_id(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn insert_row(&self, new: &NewOperation<'_>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO outbox (id, user_id, table_name, record_key, op, payload, created_at, attempts, revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0)",
            params![
                new.id,
                new.user_id,
                new.table,
                new.record_key.encode(),
                new.op.as_str(),
                serde_json::to_string(&new.payload)?,
                to_iso(new.now)
            ],
        )?;
        Ok(())
    }

    fn select<P: rusqlite::Params>(&self, clause: &str, params: P) -> Result<Vec<OutboxOperation>> {
        let sql = format!("SELECT {} FROM outbox {}", COLUMNS, clause);
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params, |row| raw_row(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawOperation::into_operation).collect()
    }
}

struct RawOperation {
    id: String,
    user_id: String,
    table: String,
    record_key: String,
    op: String,
    payload: String,
    created_at: String,
    attempts: i64,
    last_error: Option<String>,
    next_attempt_at: Option<String>,
    revision: i64,
    dispatched: bool,
}

impl RawOperation {
    fn into_operation(self) -> Result<OutboxOperation> {
        let created_at = parse_iso(&self.created_at).ok_or_else(|| {
            CalendarSyncError::Database(format!(
                "outbox {} created_at 无法解析: {}",
                self.id, self.created_at
            ))
        })?;
        Ok(OutboxOperation {
            record_key: RecordKey::decode(&self.record_key)?,
            op: self.op.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            created_at,
            attempts: self.attempts.max(0) as u32,
            next_attempt_at: self.next_attempt_at.as_deref().and_then(parse_iso),
            id: self.id,
            user_id: self.user_id,
            table: self.table,
            last_error: self.last_error,
            revision: self.revision,
            dispatched: self.dispatched,
        })
    }
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawOperation> {
    Ok(RawOperation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        table: row.get(2)?,
        record_key: row.get(3)?,
        op: row.get(4)?,
        payload: row.get(5)?,
        created_at: row.get(6)?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        next_attempt_at: row.get(9)?,
        revision: row.get(10)?,
        dispatched: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrate::init_db;
    use chrono::TimeZone;
    use serde_json::json;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&mut conn).unwrap();
        conn
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_770_000_000 + secs, 0).unwrap()
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn enqueue(
        dao: &OutboxDao<'_>,
        id: &str,
        key: &RecordKey,
        op: OpKind,
        body: Value,
        secs: i64,
    ) -> EnqueueOutcome {
        dao.enqueue(NewOperation {
            id: id.to_string(),
            user_id: "u1",
            table: "events",
            record_key: key,
            op,
            payload: payload(body),
            now: at(secs),
        })
        .unwrap()
    }

    #[test]
    fn insert_then_updates_collapse_into_insert() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("a");
        enqueue(&dao, "op-1", &key, OpKind::Insert, json!({"id": "a", "title": "t0", "color": "red"}), 0);
        let outcome = enqueue(&dao, "op-2", &key, OpKind::Update, json!({"title": "t1"}), 1);
        assert_eq!(outcome, EnqueueOutcome::Merged { id: "op-1".into() });
        enqueue(&dao, "op-3", &key, OpKind::Update, json!({"title": "t2", "notes": "n"}), 2);

        let ops = dao.list("u1").unwrap();
        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.op, OpKind::Insert);
        assert_eq!(
            Value::Object(op.payload.clone()),
            json!({"id": "a", "title": "t2", "color": "red", "notes": "n"})
        );
        assert_eq!(op.created_at, at(2));
        assert_eq!(op.revision, 2);
    }

    #[test]
    fn delete_after_insert_cancels() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("b");
        enqueue(&dao, "op-1", &key, OpKind::Insert, json!({"id": "b"}), 0);
        enqueue(&dao, "op-2", &key, OpKind::Update, json!({"title": "x"}), 1);
        let outcome = enqueue(&dao, "op-3", &key, OpKind::Delete, json!({"id": "b"}), 2);
        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert!(dao.list("u1").unwrap().is_empty());
    }

    #[test]
    fn delete_after_dispatched_insert_is_sent() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("b2");
        enqueue(&dao, "op-1", &key, OpKind::Insert, json!({"id": "b2"}), 0);
        assert_eq!(dao.mark_dispatched(&["op-1".to_string()]).unwrap(), vec!["op-1"]);
        assert!(dao.get("op-1").unwrap().unwrap().dispatched);

        // 已发出的 insert 结果未知，远端可能已有该记录
        let outcome = enqueue(&dao, "op-2", &key, OpKind::Delete, json!({"id": "b2"}), 1);
        assert_eq!(outcome, EnqueueOutcome::Replaced { id: "op-2".into() });
        let ops = dao.list("u1").unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::Delete);
    }

    #[test]
    fn insert_over_delete_is_never_cancelled() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("b3");
        enqueue(&dao, "op-1", &key, OpKind::Delete, json!({"id": "b3"}), 0);
        enqueue(&dao, "op-2", &key, OpKind::Insert, json!({"id": "b3"}), 1);
        assert!(dao.get("op-2").unwrap().unwrap().dispatched);
        let outcome = enqueue(&dao, "op-3", &key, OpKind::Delete, json!({"id": "b3"}), 2);
        assert_eq!(outcome, EnqueueOutcome::Replaced { id: "op-3".into() });
    }

    #[test]
    fn mark_dispatched_skips_cancelled_operations() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("b4");
        enqueue(&dao, "op-1", &key, OpKind::Insert, json!({"id": "b4"}), 0);
        enqueue(&dao, "op-2", &key, OpKind::Delete, json!({"id": "b4"}), 1);
        assert!(dao.mark_dispatched(&["op-1".to_string()]).unwrap().is_empty());
    }

    #[test]
    fn delete_after_update_replaces() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("c");
        enqueue(&dao, "op-1", &key, OpKind::Update, json!({"title": "x"}), 0);
        let outcome = enqueue(&dao, "op-2", &key, OpKind::Delete, json!({"id": "c"}), 1);
        assert_eq!(outcome, EnqueueOutcome::Replaced { id: "op-2".into() });
        let ops = dao.list("u1").unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::Delete);
    }

    #[test]
    fn delete_without_existing_appends() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("d");
        let outcome = enqueue(&dao, "op-1", &key, OpKind::Delete, json!({"id": "d"}), 0);
        assert_eq!(outcome, EnqueueOutcome::Appended { id: "op-1".into() });
    }

    #[test]
    fn update_after_update_is_last_write_wins_and_resets_attempts() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("e");
        enqueue(&dao, "op-1", &key, OpKind::Update, json!({"title": "x", "color": "red"}), 0);
        let op = dao.get("op-1").unwrap().unwrap();
        dao.record_retry(&OutboxRetry {
            id: op.id.clone(),
            revision: op.revision,
            attempts: 3,
            next_attempt_at: at(100),
        })
        .unwrap();

        enqueue(&dao, "op-2", &key, OpKind::Update, json!({"title": "y"}), 5);
        let op = dao.get("op-1").unwrap().unwrap();
        assert_eq!(op.op, OpKind::Update);
        assert_eq!(op.attempts, 0);
        assert!(op.next_attempt_at.is_none());
        assert_eq!(Value::Object(op.payload), json!({"title": "y", "color": "red"}));
    }

    #[test]
    fn update_after_delete_replaces_delete() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("f");
        enqueue(&dao, "op-1", &key, OpKind::Delete, json!({"id": "f"}), 0);
        enqueue(&dao, "op-2", &key, OpKind::Update, json!({"id": "f", "title": "back"}), 1);
        let ops = dao.list("u1").unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::Update);
        assert_eq!(ops[0].id, "op-2");
    }

    #[test]
    fn duplicates_are_pruned() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("g");
        // 模拟历史遗留的重复行
        for (id, secs) in [("old-1", 0), ("old-2", 1)] {
            conn.execute(
                "INSERT INTO outbox (id, user_id, table_name, record_key, op, payload, created_at)
                 VALUES (?1, 'u1', 'events', ?2, 'update', '{}', ?3)",
                params![id, key.encode(), to_iso(at(secs))],
            )
            .unwrap();
        }
        enqueue(&dao, "op-3", &key, OpKind::Update, json!({"title": "z"}), 2);
        let ops = dao.list("u1").unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, "old-1");
    }

    #[test]
    fn at_most_one_live_operation_per_key() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let keys = [RecordKey::single("k1"), RecordKey::single("k2")];
        let ops = [OpKind::Insert, OpKind::Update, OpKind::Delete, OpKind::Update, OpKind::Insert, OpKind::Delete, OpKind::Delete];
        let mut n = 0;
        for op in ops {
            for key in &keys {
                n += 1;
                enqueue(&dao, &format!("op-{}", n), key, op, json!({"id": key.to_string()}), n);
                assert!(dao.live_for("u1", "events", key).unwrap().len() <= 1);
            }
        }
    }

    #[test]
    fn ack_respects_revision() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        let key = RecordKey::single("h");
        enqueue(&dao, "op-1", &key, OpKind::Insert, json!({"id": "h"}), 0);
        let in_flight = dao.get("op-1").unwrap().unwrap().ack();
        enqueue(&dao, "op-2", &key, OpKind::Update, json!({"title": "later"}), 1);
        assert_eq!(dao.ack(&[in_flight]).unwrap(), 0);
        let current = dao.get("op-1").unwrap().unwrap();
        assert_eq!(dao.ack(&[current.ack()]).unwrap(), 1);
        assert!(dao.list("u1").unwrap().is_empty());
    }

    #[test]
    fn due_excludes_parked_and_backing_off() {
        let conn = conn();
        let dao = OutboxDao::new(&conn);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            enqueue(&dao, &format!("op-{}", i), &RecordKey::single(*id), OpKind::Insert, json!({"id": id}), i as i64);
        }
        let ops = dao.list("u1").unwrap();
        dao.park(&ops[0].ack(), "401").unwrap();
        dao.record_retry(&OutboxRetry {
            id: ops[1].id.clone(),
            revision: ops[1].revision,
            attempts: 1,
            next_attempt_at: at(60),
        })
        .unwrap();

        let due: Vec<_> = dao.due("u1", at(10)).unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(due, vec!["op-2"]);
        assert_eq!(dao.due("u1", at(60)).unwrap().len(), 2);

        let counts = dao.counts("u1").unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.parked, 1);
        assert_eq!(counts.next_due_at, Some(at(60)));

        assert_eq!(dao.retry_parked("u1").unwrap(), 1);
        assert_eq!(dao.counts("u1").unwrap().parked, 0);
    }
}
