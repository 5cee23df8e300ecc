//! 同步编排器
//!
//! - push: 在跨实例锁下排空 outbox，按表依赖顺序分组发送
//! - pull: 按水位增量拉取，应用跳过规则后写入本地库
//!
//! 远端失败不会让调用方的本地修改失败：失败体现在 outbox 的 attempts / last_error
//! 与 [`SyncStatus`] 上。本地存储错误直接上抛。

mod pull;
mod push;

pub use pull::PullSummary;
pub use push::PushReport;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::config::CalendarSyncConfig;
use crate::error::Result;
use crate::events::{event_builders, SyncStatus};
use crate::remote::RemoteService;
use crate::storage::{LocalStore, RetryPolicy};
use crate::sync::InstanceCoordinator;

pub struct SyncOrchestrator {
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    coordinator: Arc<InstanceCoordinator>,
    retry_policy: RetryPolicy,
    lock_name: String,
    page_size: usize,
    status: RwLock<SyncStatus>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("store", &self.store)
            .field("lock_name", &self.lock_name)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl SyncOrchestrator {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        config: &CalendarSyncConfig,
    ) -> Self {
        let coordinator = Arc::new(InstanceCoordinator::new(
            store.db().clone(),
            config.lock_config.clone(),
            store.clock().clone(),
        ));
        Self {
            store,
            remote,
            coordinator,
            retry_policy: RetryPolicy::new(config.retry_config.clone()),
            lock_name: config.lock_config.lock_name.clone(),
            page_size: config.remote.page_size.max(1),
            status: RwLock::new(SyncStatus::default()),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<InstanceCoordinator> {
        &self.coordinator
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    /// push 后 pull 全部表
    pub async fn sync(&self, user_id: &str) -> Result<(PushReport, PullSummary)> {
        let pushed = self.push(user_id).await?;
        let pulled = self.pull_all(user_id).await?;
        Ok((pushed, pulled))
    }

    fn set_syncing(&self, syncing: bool) {
        self.status.write().syncing = syncing;
    }

    fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        f(&mut self.status.write());
    }

    /// 以当前 outbox 计数刷新状态并广播
    pub async fn publish_status(&self, user_id: &str) -> Result<SyncStatus> {
        let counts = self.store.outbox().counts(user_id).await?;
        let status = {
            let mut status = self.status.write();
            status.apply_counts(&counts);
            status.clone()
        };
        self.store
            .events()
            .emit(event_builders::sync_status_changed(status.clone()))
            .await;
        Ok(status)
    }

    /// 运行结束后的状态收尾；本地库已关闭时只记录日志
    async fn finish(&self, user_id: &str) {
        self.set_syncing(false);
        if let Err(e) = self.publish_status(user_id).await {
            warn!("刷新同步状态失败: {}", e);
        }
    }
}
