//! 网络状态监控
//!
//! 平台层实现 [`NetworkStatusListener`]；[`NetworkMonitor`] 维护当前状态并广播变化。
//! 调度器订阅变化，在 离线 → 在线 时触发一次完整同步。

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    Online,
    Offline,
    Connecting,
    /// 网络受限（仍可访问远端）
    Limited,
}

impl NetworkStatus {
    pub fn is_reachable(self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: u64,
}

impl NetworkStatusEvent {
    /// 从不可达变为可达
    pub fn is_reconnect(&self) -> bool {
        !self.old_status.is_reachable() && self.new_status.is_reachable()
    }
}

/// 网络状态监听器（由平台层实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    async fn current_status(&self) -> NetworkStatus;

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    async fn stop_monitoring(&self);
}

#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Option<Arc<dyn NetworkStatusListener>>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
    cancel: CancellationToken,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        Self::with_listener(Some(listener))
    }

    /// 无平台监听器：状态只能通过 [`set_status`](Self::set_status) 更新，初始视为在线
    pub fn manual() -> Self {
        let monitor = Self::with_listener(None);
        *monitor.current_status.write() = NetworkStatus::Online;
        monitor
    }

    fn with_listener(listener: Option<Arc<dyn NetworkStatusListener>>) -> Self {
        let (status_sender, _) = broadcast::channel(64);
        Self {
            listener,
            status_sender,
            current_status: Arc::new(RwLock::new(NetworkStatus::Offline)),
            cancel: CancellationToken::new(),
        }
    }

    /// 读取初始状态并转发平台监听器的事件
    pub async fn start(&self) -> Result<()> {
        let Some(listener) = self.listener.clone() else {
            return Ok(());
        };
        *self.current_status.write() = listener.current_status().await;
        let mut receiver = listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => event,
                };
                match event {
                    Ok(event) => {
                        *current_status.write() = event.new_status;
                        debug!("网络状态: {:?} -> {:?}", event.old_status, event.new_status);
                        let _ = status_sender.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            listener.stop_monitoring().await;
        });
        info!("网络监控已启动");
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> NetworkStatus {
        *self.current_status.read()
    }

    /// 手动设置状态；状态不变时不广播
    pub fn set_status(&self, new_status: NetworkStatus) {
        let old_status = std::mem::replace(&mut *self.current_status.write(), new_status);
        if old_status == new_status {
            return;
        }
        let _ = self.status_sender.send(NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: chrono::Utc::now().timestamp() as u64,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    pub fn is_reachable(&self) -> bool {
        self.status().is_reachable()
    }
}
