//! 分发错误类型
//!
//! 执行器与控制器共用同一套错误分类：调用方按 ErrorKind 分支（404 / 失败作业 / 降级后台），
//! 不做字符串匹配。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 执行器、控制器、入口层可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// intent 未注册，或作业不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 执行器自身的调用超时（不是快速路径的同步等待上限）
    #[error("Execution timed out: {0}")]
    Timeout(String),

    /// 远端依赖返回失败
    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Internal error: {0}")]
    Internal(String),

    /// 请求格式错误（例如回调缺少 job_id）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 后台队列或快速路径执行位已满
    #[error("Gateway at capacity ({0} slots)")]
    Overloaded(usize),
}

/// 错误分类（可序列化，写入作业记录与响应体）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Timeout,
    UpstreamError,
    InternalError,
    ValidationError,
    Overloaded,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Upstream { .. } => ErrorKind::UpstreamError,
            Self::Internal(_) => ErrorKind::InternalError,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Overloaded(_) => ErrorKind::Overloaded,
        }
    }

    /// 快速路径上直接返回给调用方、不落为失败作业的错误
    pub fn is_client_facing(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Validation(_))
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Overloaded => "overloaded",
        }
    }
}

/// 作业存储后端错误
#[derive(Error, Debug, Clone)]
#[error("Job store error: {0}")]
pub struct StoreError(pub String);

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        DispatchError::Internal(e.to_string())
    }
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(DispatchError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            DispatchError::Upstream { status: 502, body: "bad".into() }.kind(),
            ErrorKind::UpstreamError
        );
        assert!(DispatchError::Validation("missing job_id".into()).is_client_facing());
        assert!(!DispatchError::Timeout("flow".into()).is_client_facing());
    }

    #[test]
    fn test_store_error_becomes_internal() {
        let err: DispatchError = StoreError("disk full".into()).into();
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_error_kind_wire_names() {
        let s = serde_json::to_string(&ErrorKind::UpstreamError).unwrap();
        assert_eq!(s, "\"upstream_error\"");
    }
}
