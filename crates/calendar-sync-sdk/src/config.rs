//! SDK 配置

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CalendarSyncError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarSyncConfig {
    /// 数据存储目录；每个用户的本地库位于 `{data_dir}/users/{user_id}/calendar.db`
    pub data_dir: PathBuf,
    pub remote: RemoteConfig,
    pub retry_config: RetryConfig,
    pub scheduler_config: SchedulerConfig,
    pub lock_config: LockConfig,
    pub event_config: EventConfig,
    /// 登出时删除该用户的本地库
    pub clear_on_logout: bool,
    pub debug_mode: bool,
}

/// 远端服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// 例如 https://xyz.example.co
    pub base_url: String,
    /// 匿名 API key（作为 `apikey` 请求头）
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    /// 增量拉取分页大小
    pub page_size: usize,
}

/// 推送退避配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 指数上限：第 n 次失败的退避为 base × 2^min(n, max_backoff_exponent)
    pub max_backoff_exponent: u32,
    /// 随机抖动幅度 (0.0-1.0)
    pub jitter_factor: f64,
}

/// 同步调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 打开会话后自动启动调度器
    pub auto_start: bool,
    /// 周期性 push + pull 间隔（秒），0 表示关闭
    pub pull_interval_secs: u64,
    /// outbox 变化后的推送防抖（毫秒）
    pub push_debounce_ms: u64,
    /// change feed 断开后的重连间隔（毫秒）
    pub feed_reconnect_delay_ms: u64,
}

/// 跨进程互斥锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// 关闭时直接执行（尽力而为）
    pub enabled: bool,
    pub lock_name: String,
    /// 租约时长；持有者崩溃后最多等待这么久
    pub lease_ttl_ms: u64,
    /// 等待锁时的轮询间隔
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub capacity: usize,
}

impl Default for CalendarSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote: RemoteConfig::default(),
            retry_config: RetryConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            lock_config: LockConfig::default(),
            event_config: EventConfig::default(),
            clear_on_logout: true,
            debug_mode: false,
        }
    }
}

/// 默认数据目录 ~/.calendar-sync/
fn default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".calendar-sync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".calendar-sync")
    } else {
        PathBuf::from("./calendar_sync_data")
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: None,
            request_timeout_secs: 30,
            page_size: 1000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_backoff_exponent: 5,
            jitter_factor: 0.1,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            pull_interval_secs: 60,
            push_debounce_ms: 250,
            feed_reconnect_delay_ms: 2_000,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_name: "calendar-outbox-drain".to_string(),
            lease_ttl_ms: 15_000,
            poll_interval_ms: 50,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

impl CalendarSyncConfig {
    pub fn builder() -> CalendarSyncConfigBuilder {
        CalendarSyncConfigBuilder::new()
    }

    pub fn user_dir(&self, user_id: &str) -> PathBuf {
        self.data_dir.join("users").join(user_id)
    }

    pub fn store_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("calendar.db")
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(CalendarSyncError::Config("data_dir 不能为空".to_string()));
        }
        if self.remote.page_size == 0 {
            return Err(CalendarSyncError::Config("page_size 必须大于 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry_config.jitter_factor) {
            return Err(CalendarSyncError::Config(format!(
                "jitter_factor 必须在 [0, 1] 内: {}",
                self.retry_config.jitter_factor
            )));
        }
        if self.retry_config.base_delay_ms > self.retry_config.max_delay_ms {
            return Err(CalendarSyncError::Config(
                "base_delay_ms 不能大于 max_delay_ms".to_string(),
            ));
        }
        if self.lock_config.enabled && self.lock_config.lease_ttl_ms == 0 {
            return Err(CalendarSyncError::Config("lease_ttl_ms 必须大于 0".to_string()));
        }
        if self.lock_config.lock_name.is_empty() {
            return Err(CalendarSyncError::Config("lock_name 不能为空".to_string()));
        }
        Ok(())
    }
}

/// 配置构建器
pub struct CalendarSyncConfigBuilder {
    config: CalendarSyncConfig,
}

impl Default for CalendarSyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CalendarSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CalendarSyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.remote.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.config.remote.api_key = Some(key.into());
        self
    }

    pub fn request_timeout(mut self, secs: u64) -> Self {
        self.config.remote.request_timeout_secs = secs;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.config.remote.page_size = size;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.config.retry_config = config;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.config.scheduler_config = config;
        self
    }

    pub fn auto_start(mut self, enabled: bool) -> Self {
        self.config.scheduler_config.auto_start = enabled;
        self
    }

    pub fn pull_interval(mut self, secs: u64) -> Self {
        self.config.scheduler_config.pull_interval_secs = secs;
        self
    }

    pub fn lock_config(mut self, config: LockConfig) -> Self {
        self.config.lock_config = config;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_config.capacity = capacity;
        self
    }

    pub fn clear_on_logout(mut self, enabled: bool) -> Self {
        self.config.clear_on_logout = enabled;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> Result<CalendarSyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
