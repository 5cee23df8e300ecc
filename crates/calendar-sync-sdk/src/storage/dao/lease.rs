//! 租约 DAO - 跨进程的协作式互斥
//!
//! `sync_lock` 中一行代表一把命名锁：持有者 + 过期时间（毫秒）。
//! 获取使用 IMMEDIATE 事务，多个进程并发争抢时只有一个能写入。

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::Result;

pub struct LeaseDao<'a> {
    conn: &'a Connection,
}

impl<'a> LeaseDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 锁空闲、已过期或已由自己持有时获取成功
    pub fn try_acquire(&self, name: &str, holder: &str, ttl_ms: i64, now_ms: i64) -> Result<bool> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let current: Option<(String, i64)> = tx
            .query_row(
                "SELECT holder, expires_at FROM sync_lock WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let free = match &current {
            None => true,
            Some((owner, expires_at)) => owner == holder || *expires_at <= now_ms,
        };
        if free {
            tx.execute(
                "INSERT INTO sync_lock (name, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at",
                params![name, holder, now_ms + ttl_ms],
            )?;
        }
        tx.commit()?;
        Ok(free)
    }

    /// 续约；锁已被他人抢占时返回 false
    pub fn renew(&self, name: &str, holder: &str, ttl_ms: i64, now_ms: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE sync_lock SET expires_at = ?1 WHERE name = ?2 AND holder = ?3",
            params![now_ms + ttl_ms, name, holder],
        )?;
        Ok(affected > 0)
    }

    pub fn release(&self, name: &str, holder: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sync_lock WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(())
    }
}
