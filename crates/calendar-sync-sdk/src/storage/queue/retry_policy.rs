use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::error::RemoteError;

/// PostgreSQL unique_violation
const UNIQUE_VIOLATION: &str = "23505";

/// 推送失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushFailureKind {
    /// 网络错误、408、429、5xx - 退避后重试
    Transient,
    /// 409 / 唯一键冲突 - 记录已在远端，视为成功
    Duplicate,
    /// 401/403 及其他 4xx - 挂起，等待外部干预
    Permanent,
}

impl PushFailureKind {
    pub fn classify(error: &RemoteError) -> Self {
        if error.status == Some(409) || error.code.as_deref() == Some(UNIQUE_VIOLATION) {
            return PushFailureKind::Duplicate;
        }
        match error.status {
            None => PushFailureKind::Transient,
            Some(408) | Some(429) => PushFailureKind::Transient,
            Some(status) if status >= 500 => PushFailureKind::Transient,
            Some(status) if (400..500).contains(&status) => PushFailureKind::Permanent,
            // 1xx/2xx/3xx 出现在错误里只可能是代理异常，按暂时性处理
            Some(_) => PushFailureKind::Transient,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, PushFailureKind::Transient)
    }
}

/// 指数退避：`min(max_delay, base × 2^min(attempts, max_exponent))`，再加 ±jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 不含抖动的退避时长（毫秒）；`attempts` 为本次失败后的累计次数
    pub fn base_delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.min(self.config.max_backoff_exponent);
        let raw = self
            .config
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
        raw.min(self.config.max_delay_ms)
    }

    /// `unit` ∈ [-1, 1]，映射到 ±jitter_factor
    pub fn delay_with_unit(&self, attempts: u32, unit: f64) -> Duration {
        let base = self.base_delay_ms(attempts) as f64;
        let unit = unit.clamp(-1.0, 1.0);
        let jittered = base * (1.0 + self.config.jitter_factor * unit);
        Duration::milliseconds(jittered.max(0.0).round() as i64)
    }

    pub fn next_delay(&self, attempts: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with_unit(attempts, unit)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        now + self.next_delay(attempts)
    }
}
