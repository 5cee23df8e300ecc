//! 记录主键：单列 id 或有序复合键

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CalendarSyncError, Result};

/// 有序主键元组。持久化编码为 JSON 数组字符串，例如 `["e1","p1"]`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(Vec<String>);

impl RecordKey {
    pub fn single(id: impl Into<String>) -> Self {
        Self(vec![id.into()])
    }

    pub fn composite<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn encode(&self) -> String {
        // Vec<String> 序列化不会失败
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let parts: Vec<String> = serde_json::from_str(encoded).map_err(|e| {
            CalendarSyncError::InvalidArgument(format!("无效 record_key {}: {}", encoded, e))
        })?;
        if parts.is_empty() {
            return Err(CalendarSyncError::InvalidArgument(
                "record_key 不能为空".to_string(),
            ));
        }
        Ok(Self(parts))
    }

    /// 按列顺序从行中取值；任一列缺失或为 null 时返回 None
    pub(crate) fn from_row(columns: &[&str], row: &Map<String, Value>) -> Option<Self> {
        columns
            .iter()
            .map(|column| key_part(row.get(*column)?))
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    pub(crate) fn to_fields(&self, columns: &[&str]) -> Map<String, Value> {
        columns
            .iter()
            .zip(self.0.iter())
            .map(|(column, value)| (column.to_string(), Value::String(value.clone())))
            .collect()
    }
}

fn key_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl From<&str> for RecordKey {
    fn from(id: &str) -> Self {
        Self::single(id)
    }
}

impl From<String> for RecordKey {
    fn from(id: String) -> Self {
        Self::single(id)
    }
}
