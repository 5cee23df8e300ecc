//! 水位 DAO - (table, user_id) → 最近同步到的 updated_at

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::utils::time::{parse_iso, to_iso};

pub struct WatermarkDao<'a> {
    conn: &'a Connection,
}

impl<'a> WatermarkDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, table: &str, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT timestamp FROM watermark WHERE table_name = ?1 AND user_id = ?2",
                params![table, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.as_deref().and_then(parse_iso))
    }

    /// 只前进不后退；返回推进后的值
    pub fn advance(&self, table: &str, user_id: &str, candidate: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next = match self.get(table, user_id)? {
            Some(current) if current >= candidate => return Ok(current),
            _ => candidate,
        };
        self.conn.execute(
            "INSERT INTO watermark (table_name, user_id, timestamp) VALUES (?1, ?2, ?3)
             ON CONFLICT(table_name, user_id) DO UPDATE SET timestamp = excluded.timestamp",
            params![table, user_id, to_iso(next)],
        )?;
        Ok(next)
    }

    pub fn list(&self, user_id: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT table_name, timestamp FROM watermark WHERE user_id = ?1 ORDER BY table_name")?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(table, ts)| parse_iso(&ts).map(|ts| (table, ts)))
            .collect())
    }
}
