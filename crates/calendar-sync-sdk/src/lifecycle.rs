//! 生命周期管理
//!
//! App 前后台切换（窗口聚焦、页面可见性变化）统一通过 [`LifecycleManager`] 分发。
//! 回到前台时调度器执行一次完整同步；切到后台时尽量把 outbox 推出去。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sync::{SyncScheduler, SyncTrigger};

/// 各模块实现此 trait 响应生命周期变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_background(&self) -> Result<()>;

    async fn on_foreground(&self) -> Result<()>;
}

#[derive(Default)]
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        debug!("生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 按注册顺序通知；某个 Hook 失败不影响其余 Hook，返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        info!("App 切换到后台");
        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("Hook #{} 后台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn notify_foreground(&self) -> Result<()> {
        info!("App 切换到前台");
        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("Hook #{} 前台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// 把前后台切换转成调度触发（会话打开时自动注册）
pub struct SyncLifecycleHook {
    scheduler: Arc<SyncScheduler>,
}

impl SyncLifecycleHook {
    pub fn new(scheduler: Arc<SyncScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        self.scheduler.trigger(SyncTrigger::OutboxChanged);
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        self.scheduler.trigger(SyncTrigger::Foreground);
        Ok(())
    }
}
