//! 上游通信错误

use thiserror::Error;

/// 与Orthanc通信时的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status}")]
    Status { status: u16 },

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// 网络错误、超时、429和5xx可以重试，其余错误重试也不会改变结果
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Transport(_) | UpstreamError::Timeout(_) => true,
            UpstreamError::Status { status } => *status == 429 || *status >= 500,
            UpstreamError::Decode(_) => false,
        }
    }

    /// 凭据被拒绝
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, UpstreamError::Status { status: 401 | 403 })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout(err.to_string())
        } else if err.is_decode() {
            UpstreamError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            UpstreamError::Status { status: status.as_u16() }
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}
