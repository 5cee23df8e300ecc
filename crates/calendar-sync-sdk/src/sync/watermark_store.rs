//! 增量拉取水位：(table, user_id) → 最近见过的 updated_at，只前进不后退

use chrono::{DateTime, Utc};
use std::str::FromStr;
use tracing::warn;

use crate::error::Result;
use crate::schema::Table;
use crate::storage::db_actor::DbActorHandle;
use crate::storage::entities::Watermark;

#[derive(Debug, Clone)]
pub struct WatermarkStore {
    db: DbActorHandle,
}

impl WatermarkStore {
    pub(crate) fn new(db: DbActorHandle) -> Self {
        Self { db }
    }

    pub async fn get(&self, table: Table, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.db
            .watermark_get(table.as_str().to_string(), user_id.to_string())
            .await
    }

    /// 推进到 `timestamp`（若更大）；返回推进后的水位
    pub async fn advance(
        &self,
        table: Table,
        user_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        self.db
            .watermark_advance(table.as_str().to_string(), user_id.to_string(), timestamp)
            .await
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Watermark>> {
        let rows = self.db.watermark_list(user_id.to_string()).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(name, timestamp)| match Table::from_str(&name) {
                Ok(table) => Some(Watermark {
                    table,
                    user_id: user_id.to_string(),
                    timestamp,
                }),
                Err(()) => {
                    warn!("忽略未登记表的水位: {}", name);
                    None
                }
            })
            .collect())
    }
}
