use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 远端服务返回的错误（HTTP 状态码 + 可选的数据库错误码）
///
/// `status` 为 None 表示请求未到达服务端（网络/传输层失败）。
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("remote error [{}]: {message}", self.label())]
pub struct RemoteError {
    pub status: Option<u16>,
    /// 服务端错误码，例如 PostgreSQL 的 "23505"（unique_violation）
    pub code: Option<String>,
    pub message: String,
}

impl RemoteError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// 写入 outbox.last_error 的短标签：优先状态码，其次错误码
    pub fn label(&self) -> String {
        match (&self.status, &self.code) {
            (Some(status), _) => status.to_string(),
            (None, Some(code)) => code.clone(),
            (None, None) => "network".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CalendarSyncError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("IO error: {0}")]
    IO(String),
    /// 入队前校验失败：本地库与 outbox 均未写入
    #[error("Validation failed for {table}: {reason}")]
    Validation { table: String, reason: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl From<std::io::Error> for CalendarSyncError {
    fn from(error: std::io::Error) -> Self {
        CalendarSyncError::IO(error.to_string())
    }
}

impl CalendarSyncError {
    /// 本地存储引擎错误（致命，直接上抛给调用方，不自动重试）
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            CalendarSyncError::Sqlite(_)
                | CalendarSyncError::Database(_)
                | CalendarSyncError::Migration(_)
                | CalendarSyncError::IO(_)
                | CalendarSyncError::ShuttingDown(_)
        )
    }

    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            CalendarSyncError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CalendarSyncError>;
