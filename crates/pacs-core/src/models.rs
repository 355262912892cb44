//! 核心数据模型定义

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 上游未返回 Content-Type 时使用的默认类型
pub const DEFAULT_CONTENT_TYPE: &str = "image/png";

/// 上游PACS中单个DICOM实例的标识符（不透明字符串）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 检查标识符
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudyId(String);

impl StudyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StudyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StudyId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for StudyId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 序列信息
///
/// 解析后在会话内视为不可变，实例列表保持上游返回的顺序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Series {
    pub id: String,
    pub modality: Option<String>,    // 检查设备类型 (CT, MR, DR等)
    pub description: Option<String>, // 序列描述
    pub series_number: Option<String>,
    pub instances: Vec<InstanceId>,
}

impl Series {
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

/// 按序列顺序展开全部实例ID
pub fn flatten_instances(series: &[Series]) -> Vec<InstanceId> {
    series
        .iter()
        .flat_map(|s| s.instances.iter().cloned())
        .collect()
}

/// 单个实例的获取结果
///
/// 每个获取周期内每个实例只产生一次，创建后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    pub instance_id: InstanceId,
    pub success: bool,
    #[serde(
        rename = "data",
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::utils::serialize_base64"
    )]
    pub payload: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 是否直接由缓存提供
    #[serde(skip)]
    pub from_cache: bool,
    /// 上游是否拒绝了凭据（401/403）
    #[serde(skip)]
    pub auth_rejected: bool,
    /// 上游返回的HTTP错误状态码
    #[serde(skip)]
    pub upstream_status: Option<u16>,
}

impl FetchResult {
    pub fn success(instance_id: InstanceId, payload: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            instance_id,
            success: true,
            payload: Some(payload),
            content_type: Some(content_type.into()),
            error: None,
            from_cache: false,
            auth_rejected: false,
            upstream_status: None,
        }
    }

    pub fn cached(instance_id: InstanceId, payload: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            from_cache: true,
            ..Self::success(instance_id, payload, content_type)
        }
    }

    pub fn failure(instance_id: InstanceId, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.is_empty() {
            error = "unknown error".to_string();
        }

        Self {
            instance_id,
            success: false,
            payload: None,
            content_type: None,
            error: Some(error),
            from_cache: false,
            auth_rejected: false,
            upstream_status: None,
        }
    }

    /// 记录上游返回的状态码
    pub fn with_upstream_status(mut self, status: Option<u16>) -> Self {
        self.upstream_status = status;
        self
    }

    /// 凭据被上游拒绝导致的失败
    pub fn auth_failure(instance_id: InstanceId, error: impl Into<String>) -> Self {
        Self {
            auth_rejected: true,
            ..Self::failure(instance_id, error)
        }
    }
}

/// 缓存状态，通过 `X-Cache-Status` 响应头暴露
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Partial,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Partial => "PARTIAL",
        }
    }

    /// 根据缓存命中数推导批次的缓存状态
    pub fn from_hits(hits: usize, total: usize) -> Self {
        if hits >= total {
            CacheStatus::Hit
        } else if hits == 0 {
            CacheStatus::Miss
        } else {
            CacheStatus::Partial
        }
    }

    /// 检查级别的缓存状态：元数据和全部实例都来自缓存才算命中
    pub fn for_study(metadata_hit: bool, hits: usize, total: usize) -> Self {
        if metadata_hit && hits >= total {
            CacheStatus::Hit
        } else if hits == 0 {
            CacheStatus::Miss
        } else {
            CacheStatus::Partial
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 批量获取的汇总结果
///
/// 不变量：`success_count + failure_count == total_requested == results.len()`，
/// `results` 与请求中的实例顺序一致。
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub results: Vec<FetchResult>,
    pub total_requested: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub cache_hits: usize,
    /// 因凭据被拒绝而失败的实例数
    pub auth_failures: usize,
    pub processing_time_secs: f64,
    /// 批次是否因截止时间而提前结束
    pub timed_out: bool,
}

impl BatchResult {
    pub fn from_results(results: Vec<FetchResult>, elapsed: Duration, timed_out: bool) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        let cache_hits = results.iter().filter(|r| r.from_cache).count();
        let auth_failures = results.iter().filter(|r| r.auth_rejected).count();

        Self {
            total_requested: results.len(),
            failure_count: results.len() - success_count,
            success_count,
            cache_hits,
            auth_failures,
            processing_time_secs: elapsed.as_secs_f64(),
            timed_out,
            results,
        }
    }

    pub fn empty() -> Self {
        Self::from_results(Vec::new(), Duration::ZERO, false)
    }

    pub fn cache_status(&self) -> CacheStatus {
        CacheStatus::from_hits(self.cache_hits, self.total_requested)
    }
}
