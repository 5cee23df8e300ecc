//! 数据访问层 (DAO)
//!
//! 每个 DAO 借用同一个 `Connection`，跨 DAO 的写入通过 [`TransactionManager`] 放进一个事务。

pub mod applier;
pub mod lease;
pub mod outbox;
pub mod record;
pub mod watermark;

pub use lease::LeaseDao;
pub use outbox::{NewOperation, OutboxDao};
pub use record::RecordDao;
pub use watermark::WatermarkDao;

use rusqlite::Connection;

use crate::error::{CalendarSyncError, Result};

/// 事务管理器 - 统一管理跨表操作的事务
pub struct TransactionManager<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// `f` 返回错误时整体回滚
    pub fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| CalendarSyncError::Database(format!("开始事务失败: {}", e)))?;

        let result = f(&tx)?;

        tx.commit()
            .map_err(|e| CalendarSyncError::Database(format!("提交事务失败: {}", e)))?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Table;
    use crate::storage::entities::Record;
    use crate::storage::migrate::init_db;
    use serde_json::json;

    #[test]
    fn failed_transaction_rolls_back_every_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&mut conn).unwrap();
        let result: Result<()> = TransactionManager::new(&conn).execute(|tx| {
            let event = json!({"id": "e1", "calendar_id": "c1"});
            RecordDao::new(tx).put(&Record::from_row(Table::Event, event.as_object().cloned().unwrap())?)?;
            let detail = json!({"event_id": "e1", "notes": "n"});
            RecordDao::new(tx).put(&Record::from_row(Table::EventDetail, detail.as_object().cloned().unwrap())?)?;
            Err(CalendarSyncError::InvalidArgument("abort".into()))
        });
        assert!(result.is_err());
        let records = RecordDao::new(&conn);
        assert_eq!(records.count(Table::Event).unwrap(), 0);
        assert_eq!(records.count(Table::EventDetail).unwrap(), 0);
    }
}
