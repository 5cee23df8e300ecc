//! 多实例互斥
//!
//! 同一数据库文件可能被多个进程（多个窗口/实例）同时打开。outbox 的排空需要互斥：
//! 进程内用 tokio Mutex 串行，进程间用库内 `sync_lock` 租约表。
//! 持有者定期续约；崩溃后最多等待一个租约时长即可被其他实例接管。
//! 租约表不可用时降级为直接执行。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::error::Result;
use crate::storage::db_actor::DbActorHandle;
use crate::utils::time::Clock;

pub struct InstanceCoordinator {
    db: DbActorHandle,
    config: LockConfig,
    holder: String,
    clock: Arc<dyn Clock>,
    local_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for InstanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCoordinator")
            .field("holder", &self.holder)
            .field("enabled", &self.config.enabled)
            .finish()
    }
}

impl InstanceCoordinator {
    pub(crate) fn new(db: DbActorHandle, config: LockConfig, clock: Arc<dyn Clock>) -> Self {
        let holder = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());
        Self {
            db,
            config,
            holder,
            clock,
            local_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    async fn local_lock(&self, lock_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.local_locks.lock().await;
        locks
            .entry(lock_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 在互斥下执行 `f`；锁原语不可用时直接执行
    pub async fn with_exclusive_access<F, Fut, T>(&self, lock_name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.config.enabled {
            debug!("跨实例锁已关闭，直接执行: {}", lock_name);
            return f().await;
        }

        let local = self.local_lock(lock_name).await;
        let _guard = local.lock().await;

        if !self.acquire_lease(lock_name).await {
            return f().await;
        }

        let heartbeat = CancellationToken::new();
        self.spawn_heartbeat(lock_name, heartbeat.clone());
        let result = f().await;
        heartbeat.cancel();

        if let Err(e) = self
            .db
            .lease_release(lock_name.to_string(), self.holder.clone())
            .await
        {
            warn!("释放跨实例锁失败: {}, error={}", lock_name, e);
        }
        result
    }

    /// 轮询直到取得租约；租约表出错时返回 false（降级为尽力而为）
    async fn acquire_lease(&self, lock_name: &str) -> bool {
        let ttl_ms = self.config.lease_ttl_ms as i64;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut waited = false;
        loop {
            let now_ms = self.clock.now().timestamp_millis();
            match self
                .db
                .lease_acquire(lock_name.to_string(), self.holder.clone(), ttl_ms, now_ms)
                .await
            {
                Ok(true) => {
                    if waited {
                        info!("取得跨实例锁: {} (holder={})", lock_name, self.holder);
                    } else {
                        debug!("取得跨实例锁: {} (holder={})", lock_name, self.holder);
                    }
                    return true;
                }
                Ok(false) => {
                    if !waited {
                        debug!("跨实例锁被占用，等待: {}", lock_name);
                        waited = true;
                    }
                    tokio::time::sleep(poll).await;
                }
                Err(e) => {
                    warn!("跨实例锁不可用，降级为直接执行: {}, error={}", lock_name, e);
                    return false;
                }
            }
        }
    }

    fn spawn_heartbeat(&self, lock_name: &str, cancel: CancellationToken) {
        let db = self.db.clone();
        let clock = self.clock.clone();
        let name = lock_name.to_string();
        let holder = self.holder.clone();
        let ttl_ms = self.config.lease_ttl_ms as i64;
        let interval = Duration::from_millis((self.config.lease_ttl_ms / 3).max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let now_ms = clock.now().timestamp_millis();
                        match db.lease_renew(name.clone(), holder.clone(), ttl_ms, now_ms).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!("跨实例锁租约已丢失: {}", name);
                                break;
                            }
                            Err(e) => {
                                warn!("续约失败: {}, error={}", name, e);
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
}
