//! 同步调度器
//!
//! 把各种触发源汇成一个串行的后台任务：
//!
//! | 触发 | 动作 |
//! |---|---|
//! | `OutboxChanged`（防抖） | push |
//! | `Backoff`（最早的 next_attempt_at 到期） | push |
//! | `Tick` / `Reconnect` / `Foreground` / `Manual` | push + 全表 pull |
//!
//! 启动时先执行一次 `Tick`。登出或切换用户时通过 `CancellationToken` 停止。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::network::NetworkMonitor;
use crate::sync::SyncOrchestrator;

/// 退避定时器的最小等待，避免时钟不一致时空转
const MIN_BACKOFF_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncTrigger {
    OutboxChanged,
    Tick,
    Reconnect,
    Foreground,
    Backoff,
    Manual,
}

impl SyncTrigger {
    pub fn push_only(self) -> bool {
        matches!(self, SyncTrigger::OutboxChanged | SyncTrigger::Backoff)
    }
}

struct SchedulerInner {
    orchestrator: Arc<SyncOrchestrator>,
    config: SchedulerConfig,
    user_id: String,
    sender: mpsc::UnboundedSender<SyncTrigger>,
    cancel: CancellationToken,
}

pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("user_id", &self.inner.user_id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SyncScheduler {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        user_id: impl Into<String>,
        config: SchedulerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SchedulerInner {
                orchestrator,
                config,
                user_id: user_id.into(),
                sender,
                cancel: CancellationToken::new(),
            }),
            receiver: Mutex::new(Some(receiver)),
            handle: Mutex::new(None),
        }
    }

    /// 启动后台任务；重复调用无效果
    pub fn start(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            debug!("调度器已启动过: user={}", self.inner.user_id);
            return;
        };
        let inner = self.inner.clone();
        let _ = inner.sender.send(SyncTrigger::Tick);
        *self.handle.lock() = Some(tokio::spawn(inner.run(receiver)));
        info!("同步调度器已启动: user={}", self.inner.user_id);
    }

    pub fn trigger(&self, trigger: SyncTrigger) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if self.inner.sender.send(trigger).is_err() {
            debug!("调度器已停止，忽略触发: {:?}", trigger);
        }
    }

    /// 本地修改入队后调用
    pub fn notify_outbox_changed(&self) {
        self.trigger(SyncTrigger::OutboxChanged);
    }

    /// 离线 → 在线 时触发 Reconnect
    pub fn watch_network(&self, monitor: &NetworkMonitor) {
        let mut events = monitor.subscribe();
        let sender = self.inner.sender.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) if event.is_reconnect() => {
                        info!("网络恢复，触发同步");
                        if sender.send(SyncTrigger::Reconnect).is_err() {
                            break;
                        }
                    }
                    Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// 停止并等待当前一轮同步结束
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("调度器任务异常结束: {}", e);
            }
        }
        info!("同步调度器已停止: user={}", self.inner.user_id);
    }
}

impl SchedulerInner {
    async fn run(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<SyncTrigger>) {
        let mut ticker = (self.config.pull_interval_secs > 0).then(|| {
            let period = Duration::from_secs(self.config.pull_interval_secs);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut next_due: Option<DateTime<Utc>> = None;

        loop {
            let backoff_wait = next_due.map(|due| self.wait_until(due));
            let trigger = tokio::select! {
                _ = self.cancel.cancelled() => break,
                trigger = receiver.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
                _ = async {
                    match ticker.as_mut() {
                        Some(ticker) => { ticker.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => SyncTrigger::Tick,
                _ = async {
                    match backoff_wait {
                        Some(wait) => tokio::time::sleep(wait).await,
                        None => std::future::pending::<()>().await,
                    }
                } => SyncTrigger::Backoff,
            };

            let Some(trigger) = self.coalesce(trigger, &mut receiver).await else {
                break;
            };
            self.execute(trigger).await;
            next_due = self.next_due(trigger).await;
        }
        debug!("调度循环退出: user={}", self.user_id);
    }

    /// outbox 触发先防抖，并把期间到达的其他触发合并为一次执行
    async fn coalesce(
        &self,
        trigger: SyncTrigger,
        receiver: &mut mpsc::UnboundedReceiver<SyncTrigger>,
    ) -> Option<SyncTrigger> {
        if trigger == SyncTrigger::OutboxChanged && self.config.push_debounce_ms > 0 {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(Duration::from_millis(self.config.push_debounce_ms)) => {}
            }
        }
        let mut merged = trigger;
        while let Ok(next) = receiver.try_recv() {
            if merged.push_only() && !next.push_only() {
                merged = next;
            }
        }
        Some(merged)
    }

    async fn execute(&self, trigger: SyncTrigger) {
        debug!("调度触发: {:?}, user={}", trigger, self.user_id);
        let result = if trigger.push_only() {
            self.orchestrator.push(&self.user_id).await.map(|_| ())
        } else {
            self.orchestrator.sync(&self.user_id).await.map(|_| ())
        };
        if let Err(e) = result {
            if e.is_storage_failure() {
                error!("同步失败（本地存储）: {:?}, error={}", trigger, e);
            } else {
                warn!("同步失败: {:?}, error={}", trigger, e);
            }
        }
    }

    /// 最早的退避到期时间；Backoff 执行后仍未到期的（时钟不一致）不再等待
    async fn next_due(&self, trigger: SyncTrigger) -> Option<DateTime<Utc>> {
        let counts = match self.orchestrator.store().outbox().counts(&self.user_id).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("读取 outbox 计数失败: {}", e);
                return None;
            }
        };
        let now = self.orchestrator.store().clock().now();
        counts
            .next_due_at
            .filter(|due| trigger != SyncTrigger::Backoff || *due > now)
    }

    fn wait_until(&self, due: DateTime<Utc>) -> Duration {
        let now = self.orchestrator.store().clock().now();
        (due - now).to_std().unwrap_or(Duration::ZERO).max(MIN_BACKOFF_WAIT)
    }
}
