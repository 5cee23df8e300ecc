//! 记录 DAO - 本地镜像的 10 张表共用
//!
//! 每张表为 `(record_key, updated_at, data)`：`data` 是完整行 JSON，二级索引建在
//! `json_extract(data, '$.field')` 上。表名只来自 [`Table`] 注册表，拼接 SQL 是安全的。

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use crate::error::{CalendarSyncError, Result};
use crate::schema::{RecordKey, Table};
use crate::storage::entities::{IndexQuery, Predicate, Record};
use crate::utils::time::{parse_iso, to_iso};

pub struct RecordDao<'a> {
    conn: &'a Connection,
}

impl<'a> RecordDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, table: Table, key: &RecordKey) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT record_key, updated_at, data FROM {} WHERE record_key = ?1",
            table.as_str()
        );
        self.conn
            .query_row(&sql, params![key.encode()], |row| raw_row(row))
            .optional()?
            .map(|raw| raw.into_record(table))
            .transpose()
    }

    pub fn exists(&self, table: Table, key: &RecordKey) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE record_key = ?1",
            table.as_str()
        );
        let count: i64 = self.conn.query_row(&sql, params![key.encode()], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// 覆盖写入整行
    pub fn put(&self, record: &Record) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (record_key, updated_at, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(record_key) DO UPDATE SET
                updated_at = excluded.updated_at,
                data = excluded.data",
            record.table.as_str()
        );
        let data = serde_json::to_string(&record.data)?;
        self.conn.execute(
            &sql,
            params![record.key.encode(), record.updated_at.map(to_iso), data],
        )?;
        Ok(())
    }

    /// 返回是否确实删除了一行
    pub fn delete(&self, table: Table, key: &RecordKey) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE record_key = ?1", table.as_str());
        let affected = self.conn.execute(&sql, params![key.encode()])?;
        Ok(affected > 0)
    }

    pub fn list(&self, table: Table) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT record_key, updated_at, data FROM {} ORDER BY record_key",
            table.as_str()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map([], |row| raw_row(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(|raw| raw.into_record(table)).collect()
    }

    /// 按二级索引查询；未建索引的字段直接拒绝
    pub fn query(&self, table: Table, query: &IndexQuery) -> Result<Vec<Record>> {
        if !table.has_index(&query.field) {
            return Err(CalendarSyncError::InvalidArgument(format!(
                "{} 没有索引 {}",
                table.as_str(),
                query.field
            )));
        }
        let column = if query.field == "updated_at" {
            "updated_at".to_string()
        } else {
            format!("json_extract(data, '$.{}')", query.field)
        };

        let (condition, args): (String, Vec<SqlValue>) = match &query.predicate {
            Predicate::Eq(value) => (format!("{} = ?1", column), vec![to_sql(value)]),
            Predicate::Between { lower, upper } => (
                format!("{} BETWEEN ?1 AND ?2", column),
                vec![to_sql(lower), to_sql(upper)],
            ),
            Predicate::AnyOf(values) => {
                if values.is_empty() {
                    return Ok(Vec::new());
                }
                let placeholders = (0..values.len())
                    .map(|i| format!("?{}", i + 1))
                    .collect::<Vec<_>>()
                    .join(", ");
                (
                    format!("{} IN ({})", column, placeholders),
                    values.iter().map(to_sql).collect(),
                )
            }
        };

        let mut sql = format!(
            "SELECT record_key, updated_at, data FROM {} WHERE {} ORDER BY {}, record_key",
            table.as_str(),
            condition,
            column
        );
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| raw_row(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(|raw| raw.into_record(table)).collect()
    }

    pub fn count(&self, table: Table) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.as_str());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

struct RawRow {
    record_key: String,
    updated_at: Option<String>,
    data: String,
}

impl RawRow {
    fn into_record(self, table: Table) -> Result<Record> {
        let key = RecordKey::decode(&self.record_key)?;
        let data: Map<String, Value> = serde_json::from_str(&self.data)?;
        Ok(Record {
            table,
            key,
            updated_at: self.updated_at.as_deref().and_then(parse_iso),
            data,
        })
    }
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        record_key: row.get(0)?,
        updated_at: row.get(1)?,
        data: row.get(2)?,
    })
}

/// JSON 值 → SQLite 值，与 json_extract 的返回类型保持一致（布尔为 0/1）
fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
