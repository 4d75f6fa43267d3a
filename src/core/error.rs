//! 同步错误分类

use reqwest::StatusCode;
use std::path::{Path, PathBuf};

/// 错误种类，决定执行器如何处理当前尝试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 放弃本次尝试，保留暂存数据，重新解析状态后重试
    Retryable,
    /// 对端或传输违反了字节范围约定，删除暂存数据，不再重试
    Fatal,
    /// 不支持的响应，直接停止，不做清理
    Unsupported,
    /// 重试次数用尽，暂存数据保留给下一次同步请求
    Terminal,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("body read failed: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid {name} header: {value:?}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("Content-Range start ({start}) doesn't match current file size ({size})")]
    RangeMismatch { start: u64, size: u64 },

    #[error("partial content received but no resumable staging file exists")]
    UnexpectedPartial,

    #[error("received {received} bytes, more than the declared {declared}")]
    Overrun { received: u64, declared: u64 },

    #[error("staging size {size} exceeds expected content length {expected}")]
    Oversize { size: u64, expected: u64 },

    #[error("unsupported response status code: {0}")]
    UnsupportedStatus(StatusCode),

    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl SyncError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn invalid_header(name: &'static str, value: Option<&str>) -> Self {
        SyncError::InvalidHeader {
            name,
            value: value.unwrap_or_default().to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Overrun { .. } | SyncError::Oversize { .. } => ErrorKind::Fatal,
            SyncError::UnsupportedStatus(_) => ErrorKind::Unsupported,
            SyncError::RetriesExhausted { .. } => ErrorKind::Terminal,
            SyncError::Io { .. }
            | SyncError::Request(_)
            | SyncError::Body(_)
            | SyncError::InvalidHeader { .. }
            | SyncError::RangeMismatch { .. }
            | SyncError::UnexpectedPartial => ErrorKind::Retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SyncError::RangeMismatch { start: 0, size: 4 }.kind(),
            ErrorKind::Retryable
        );
        assert_eq!(
            SyncError::Overrun { received: 11, declared: 10 }.kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            SyncError::UnsupportedStatus(StatusCode::NOT_FOUND).kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            SyncError::RetriesExhausted { attempts: 4 }.kind(),
            ErrorKind::Terminal
        );
    }
}
