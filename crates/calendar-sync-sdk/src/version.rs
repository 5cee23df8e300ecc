//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml
//! - **Migration Version** → migrations/ 文件（由 refinery 管理，build.rs 扫描）
//! - **Build Metadata** → vergen

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（vergen 生成；非 git 工作区时为占位值）
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// 构建时间（vergen 生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 当前 SDK 支持的最高本地库 migration 版本。
/// 打开本地库时若 refinery_schema_history 中的版本更高则拒绝（防降级后 schema 不兼容）。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// 运行时版本信息（用于日志与诊断）
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub sdk_version: &'static str,
    pub git_sha: &'static str,
    pub build_time: &'static str,
    pub db_version: i64,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        sdk_version: SDK_VERSION,
        git_sha: GIT_SHA,
        build_time: BUILD_TIME,
        db_version: SDK_DB_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_db_version_digits() {
        assert_eq!(parse_db_version("0"), 0);
        assert_eq!(parse_db_version("12"), 12);
        assert_eq!(parse_db_version(""), 0);
    }

    #[test]
    fn db_version_tracks_migrations() {
        // migrations/ 至少包含 V1
        assert!(SDK_DB_VERSION >= 1);
        assert_eq!(version_info().db_version, SDK_DB_VERSION);
    }
}
