//! 跨 DAO 的写入流程，调用方负责包在同一事务中
//!
//! - 本地修改：乐观写本地表 + 合并入队
//! - 远端变化：按跳过规则写本地表，可选推进水位

use tracing::debug;

use crate::error::{CalendarSyncError, Result};
use crate::schema::Table;
use crate::storage::dao::{NewOperation, OutboxDao, RecordDao, WatermarkDao};
use crate::storage::entities::{
    merge_fields, ApplyReport, MutationResult, OpKind, PreparedMutation, Record, RemoteChange,
};

/// 本地修改：写本地表并入队。任一条失败时整体由事务回滚。
pub fn apply_mutations(
    conn: &rusqlite::Connection,
    user_id: &str,
    mutations: Vec<PreparedMutation>,
) -> Result<MutationResult> {
    let records = RecordDao::new(conn);
    let outbox = OutboxDao::new(conn);
    let mut result = MutationResult::default();

    for mutation in mutations {
        let stored = match mutation.op {
            OpKind::Insert => {
                let row = mutation.row.ok_or_else(|| {
                    CalendarSyncError::InvalidArgument(format!(
                        "{} insert 缺少行数据",
                        mutation.table
                    ))
                })?;
                let record = Record::from_row(mutation.table, row)?;
                records.put(&record)?;
                Some(record)
            }
            OpKind::Update => {
                let mut record = records.get(mutation.table, &mutation.key)?.ok_or_else(|| {
                    CalendarSyncError::NotFound(format!("{} {}", mutation.table, mutation.key))
                })?;
                if let Some(patch) = &mutation.row {
                    merge_fields(&mut record.data, patch);
                }
                record = Record::from_row(mutation.table, record.data)?;
                records.put(&record)?;
                Some(record)
            }
            OpKind::Delete => {
                records.delete(mutation.table, &mutation.key)?;
                None
            }
        };

        let outcome = outbox.enqueue(NewOperation {
            id: mutation.op_id,
            user_id,
            table: mutation.table.as_str(),
            record_key: &mutation.key,
            op: mutation.op,
            payload: mutation.outbox_payload,
            now: mutation.now,
        })?;
        debug!(
            "本地修改入队: table={}, key={}, op={}, outcome={:?}",
            mutation.table, mutation.key, mutation.op, outcome
        );
        result.records.push(stored);
        result.outcomes.push(outcome);
    }
    Ok(result)
}

/// 远端变化：有待推送操作的记录跳过；本地副本严格更新时跳过。
/// `advance_watermark` 为 true 时，水位推进到本批最大 updated_at（包括被跳过的行）。
pub fn apply_remote(
    conn: &rusqlite::Connection,
    user_id: &str,
    table: Table,
    changes: &[RemoteChange],
    advance_watermark: bool,
) -> Result<ApplyReport> {
    let records = RecordDao::new(conn);
    let outbox = OutboxDao::new(conn);
    let mut report = ApplyReport::default();

    for change in changes {
        let key = change.key();
        if outbox.has_live(user_id, table.as_str(), key)? {
            report.skipped_pending += 1;
            continue;
        }
        let local = records.get(table, key)?;
        let stale = match (local.as_ref().and_then(|r| r.updated_at), change.updated_at()) {
            (Some(local_ts), Some(remote_ts)) => local_ts > remote_ts,
            _ => false,
        };
        if stale {
            report.skipped_stale += 1;
            continue;
        }

        match change {
            RemoteChange::Upsert {
                key,
                updated_at,
                data,
            } => {
                records.put(&Record {
                    table,
                    key: key.clone(),
                    updated_at: *updated_at,
                    data: data.clone(),
                })?;
                report.upserted.push(key.clone());
            }
            RemoteChange::Delete { key, .. } => {
                if records.delete(table, key)? {
                    report.deleted.push(key.clone());
                }
            }
        }
    }

    if advance_watermark {
        let watermarks = WatermarkDao::new(conn);
        report.watermark = match changes.iter().filter_map(RemoteChange::updated_at).max() {
            Some(max_seen) => Some(watermarks.advance(table.as_str(), user_id, max_seen)?),
            None => watermarks.get(table.as_str(), user_id)?,
        };
    }

    debug!(
        "应用远端变化: table={}, upserted={}, deleted={}, skipped_pending={}, skipped_stale={}",
        table,
        report.upserted.len(),
        report.deleted.len(),
        report.skipped_pending,
        report.skipped_stale
    );
    Ok(report)
}
