//! 数据实体定义 - 本地库、outbox、水位的类型安全表示

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CalendarSyncError, Result};
use crate::schema::{RecordKey, Table};
use crate::utils::time::timestamp_from_json;

/// 本地镜像中的一行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub table: Table,
    pub key: RecordKey,
    pub updated_at: Option<DateTime<Utc>>,
    pub data: Map<String, Value>,
}

impl Record {
    /// 从完整行构造：主键与 updated_at 均取自行数据
    pub fn from_row(table: Table, data: Map<String, Value>) -> Result<Self> {
        let key = table.key_of(&data)?;
        let updated_at = data.get("updated_at").and_then(timestamp_from_json);
        Ok(Self {
            table,
            key,
            updated_at,
            data,
        })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.data)
    }
}

/// outbox 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }

    /// insert / update 都走 upsert
    pub fn is_upsert(self) -> bool {
        !matches!(self, OpKind::Delete)
    }
}

impl FromStr for OpKind {
    type Err = CalendarSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(OpKind::Insert),
            "update" => Ok(OpKind::Update),
            "delete" => Ok(OpKind::Delete),
            other => Err(CalendarSyncError::Database(format!("未知 op: {}", other))),
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 待推送操作
///
/// 同一 `(table, record_key)` 至多一条；`attempts` / `last_error` / `next_attempt_at` 只由推送路径修改。
/// `revision` 在每次合并时递增，推送确认时据此判断期间是否有新的本地修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxOperation {
    pub id: String,
    pub user_id: String,
    /// 表名保持原样：旧版本遗留的未登记表也能被推送
    pub table: String,
    pub record_key: RecordKey,
    pub op: OpKind,
    pub payload: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub revision: i64,
    /// 记录可能已存在于远端：操作发出过（结果未知也算），或它替换了一条 delete
    pub dispatched: bool,
}

impl OutboxOperation {
    pub fn table_ref(&self) -> Option<Table> {
        Table::from_str(&self.table).ok()
    }

    /// 永久失败，等待外部干预（如重新登录）
    pub fn is_parked(&self) -> bool {
        self.last_error.is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_parked() && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn ack(&self) -> OutboxAck {
        OutboxAck {
            id: self.id.clone(),
            revision: self.revision,
        }
    }
}

/// 推送确认：仅当 revision 未变时删除
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxAck {
    pub id: String,
    pub revision: i64,
}

/// 推送失败后的退避安排
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRetry {
    pub id: String,
    pub revision: i64,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
}

/// 入队合并结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// 新增一条操作
    Appended { id: String },
    /// 合并进已有操作
    Merged { id: String },
    /// 已有操作被替换为新的操作
    Replaced { id: String },
    /// 未发出的 insert 后 delete：记录从未到达远端，操作全部取消
    Cancelled,
}

impl EnqueueOutcome {
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            EnqueueOutcome::Appended { id }
            | EnqueueOutcome::Merged { id }
            | EnqueueOutcome::Replaced { id } => Some(id),
            EnqueueOutcome::Cancelled => None,
        }
    }
}

/// outbox 计数（用于非阻塞的待同步/错误指示）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    /// 未挂起的待推送操作
    pub pending: usize,
    /// 永久失败挂起的操作
    pub parked: usize,
    /// 最早的退避到期时间
    pub next_due_at: Option<DateTime<Utc>>,
}

/// 增量拉取水位
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub table: Table,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

/// 二级索引谓词
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    /// 闭区间
    Between { lower: Value, upper: Value },
    AnyOf(Vec<Value>),
}

/// 按二级索引查询
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    pub field: String,
    pub predicate: Predicate,
    pub limit: Option<u32>,
}

impl IndexQuery {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            predicate: Predicate::Eq(value.into()),
            limit: None,
        }
    }

    pub fn between(field: impl Into<String>, lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            predicate: Predicate::Between {
                lower: lower.into(),
                upper: upper.into(),
            },
            limit: None,
        }
    }

    pub fn any_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            field: field.into(),
            predicate: Predicate::AnyOf(values.into_iter().map(Into::into).collect()),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// 事务内的原始写入（不入 outbox）
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    Put(Record),
    Delete { table: Table, key: RecordKey },
}

/// 远端观察到的一行变化（pull、change feed、组合端点响应）
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Upsert {
        key: RecordKey,
        updated_at: Option<DateTime<Utc>>,
        data: Map<String, Value>,
    },
    Delete {
        key: RecordKey,
        updated_at: Option<DateTime<Utc>>,
    },
}

impl RemoteChange {
    /// 远端行；`deleted_at` 非空视为墓碑
    pub fn from_row(table: Table, row: Map<String, Value>) -> Result<Self> {
        let key = table.key_of(&row)?;
        let updated_at = row.get("updated_at").and_then(timestamp_from_json);
        let tombstone = row.get("deleted_at").map_or(false, |v| !v.is_null());
        if tombstone {
            Ok(RemoteChange::Delete { key, updated_at })
        } else {
            Ok(RemoteChange::Upsert {
                key,
                updated_at,
                data: row,
            })
        }
    }

    pub fn key(&self) -> &RecordKey {
        match self {
            RemoteChange::Upsert { key, .. } | RemoteChange::Delete { key, .. } => key,
        }
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RemoteChange::Upsert { updated_at, .. } | RemoteChange::Delete { updated_at, .. } => {
                *updated_at
            }
        }
    }
}

/// 远端变化应用结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub upserted: Vec<RecordKey>,
    pub deleted: Vec<RecordKey>,
    /// 本地有待推送操作而跳过
    pub skipped_pending: usize,
    /// 本地副本更新而跳过
    pub skipped_stale: usize,
    /// 应用后的水位（仅 pull 推进）
    pub watermark: Option<DateTime<Utc>>,
}

impl ApplyReport {
    pub fn changed(&self) -> usize {
        self.upserted.len() + self.deleted.len()
    }
}

/// 一次本地修改（已校验、已补全），在同一事务中写本地库并入队
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedMutation {
    pub table: Table,
    pub key: RecordKey,
    pub op: OpKind,
    /// insert: 完整行；update: 字段补丁；delete: None
    pub row: Option<Map<String, Value>>,
    pub outbox_payload: Map<String, Value>,
    pub op_id: String,
    pub now: DateTime<Utc>,
}

/// 本地库写入结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationResult {
    pub records: Vec<Option<Record>>,
    pub outcomes: Vec<EnqueueOutcome>,
}

/// 字段级合并：补丁中出现的键覆盖原值
pub fn merge_fields(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (field, value) in patch {
        base.insert(field.clone(), value.clone());
    }
}
