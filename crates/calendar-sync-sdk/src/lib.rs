//! Calendar Sync SDK - 本地优先的日历数据同步
//!
//! 本 SDK 提供：
//! - 本地 SQLite 记录库（按表索引，修改与入队在同一事务中完成）
//! - Outbox：同一记录的未推送修改在入队时合并
//! - 按表水位的增量 pull，未推送的本地修改优先
//! - 多实例（多进程/多窗口）共享一个本地库时的推送互斥
//! - 服务端 change feed 实时写入，重连后自动补齐
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use calendar_sync_sdk::{CalendarSync, CalendarSyncConfig, Table};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CalendarSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .base_url("https://project.example.com")
//!         .build()?;
//!
//!     // 登录后打开会话，自动开始后台同步
//!     let session = CalendarSync::builder(config)
//!         .access_token("jwt")
//!         .open("user-1")
//!         .await?;
//!
//!     let row = json!({"title": "Standup"}).as_object().cloned().unwrap_or_default();
//!     let event = session.insert(Table::Event, row).await?;
//!     println!("已写入本地: {}", event.key);
//!
//!     // 登出：停止同步并清除本地数据
//!     session.logout().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod remote;
pub mod schema;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

pub use config::{
    CalendarSyncConfig, CalendarSyncConfigBuilder, EventConfig, LockConfig, RemoteConfig,
    RetryConfig, SchedulerConfig,
};
pub use error::{CalendarSyncError, RemoteError, Result};
pub use events::{ChangeOrigin, EventFilter, SyncEvent, SyncStatus};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusListener};
pub use remote::{ChangeFeedSource, HttpRemoteService, InMemoryChangeFeed, InMemoryRemote, RemoteService};
pub use schema::{RecordKey, Table};
pub use sdk::{CalendarSync, CalendarSyncBuilder, Mutation, RecordValidator};
pub use storage::{IndexQuery, LocalStore, OpKind, OutboxOperation, Predicate, Record};
pub use sync::{PullSummary, PushReport, SyncOrchestrator, SyncScheduler, SyncTrigger};
pub use utils::time::{Clock, IdGenerator};
