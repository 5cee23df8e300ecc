//! 同步模块
//!
//! - [`WatermarkStore`]: 每 (表, 用户) 的增量水位
//! - [`InstanceCoordinator`]: 同一数据库文件上多实例之间的 outbox 排空互斥
//! - [`SyncOrchestrator`]: push（排空 outbox）与 pull（按水位增量拉取）
//! - [`ChangeFeedBridge`]: 服务端推送的变更流，重连后以 pull 补齐
//! - [`SyncScheduler`]: 触发源汇总与防抖

pub mod change_feed;
pub mod coordinator;
pub mod orchestrator;
pub mod scheduler;
pub mod watermark_store;

pub use change_feed::ChangeFeedBridge;
pub use coordinator::InstanceCoordinator;
pub use orchestrator::{PullSummary, PushReport, SyncOrchestrator};
pub use scheduler::{SyncScheduler, SyncTrigger};
pub use watermark_store::WatermarkStore;
