//! 日志初始化
//!
//! SDK 自身只通过 `tracing` 宏输出；宿主程序可以装自己的 subscriber，
//! 也可以调用 [`init_tracing`] 使用默认的 fmt 输出。

use tracing_subscriber::EnvFilter;

/// 未设置 `RUST_LOG` 时使用的过滤规则
pub fn default_filter(debug_mode: bool) -> &'static str {
    if debug_mode {
        "calendar_sync_sdk=debug,info"
    } else {
        "calendar_sync_sdk=info,warn"
    }
}

/// 安装全局 fmt subscriber；已安装过时返回 false
pub fn init_tracing(debug_mode: bool) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug_mode)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug_mode)
        .with_thread_ids(debug_mode)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        init_tracing(true);
        assert!(!init_tracing(false));
        assert!(default_filter(true).contains("debug"));
    }
}
