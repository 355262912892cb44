//! 错误定义模块

use thiserror::Error;

/// 影像获取服务统一错误类型
///
/// 实例级别的失败不会以该类型向上传播，而是记录在 `FetchResult.error` 中；
/// 这里只描述会使整个请求失败的错误。需要 `Clone` 以便共享的进行中请求把同一结果分发给所有等待方。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("请求格式错误: {0}")]
    MalformedRequest(String),

    #[error("检查未找到: {0}")]
    StudyNotFound(String),

    #[error("元数据解析失败: {0}")]
    MetadataResolution(String),

    #[error("上游认证失败: {0}")]
    UpstreamAuth(String),

    #[error("上游服务不可达: {0}")]
    UpstreamUnavailable(String),

    #[error("实例获取失败: {0}")]
    InstanceFetch(String),

    #[error("请求超时: {0}")]
    Timeout(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl PacsError {
    /// 错误类别的稳定名称，用于响应体和日志字段
    pub fn kind(&self) -> &'static str {
        match self {
            PacsError::Config(_) => "config",
            PacsError::MalformedRequest(_) => "malformed_request",
            PacsError::StudyNotFound(_) => "study_not_found",
            PacsError::MetadataResolution(_) => "metadata_resolution",
            PacsError::UpstreamAuth(_) => "upstream_auth",
            PacsError::UpstreamUnavailable(_) => "upstream_unavailable",
            PacsError::InstanceFetch(_) => "instance_fetch",
            PacsError::Timeout(_) => "timeout",
            PacsError::Serialization(_) => "serialization",
            PacsError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for PacsError {
    fn from(err: serde_json::Error) -> Self {
        PacsError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for PacsError {
    fn from(err: std::io::Error) -> Self {
        PacsError::Internal(err.to_string())
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;
