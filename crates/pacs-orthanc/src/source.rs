//! 上游数据源接口

use async_trait::async_trait;
use bytes::Bytes;
use pacs_core::{InstanceId, StudyId};
use serde_json::Value;

use crate::error::UpstreamError;

/// 实例预览图
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub payload: Bytes,
    pub content_type: String,
}

/// 上游返回的序列描述
///
/// `instances` 为 `None` 表示上游没有内联实例列表，需要单独查询。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesDescriptor {
    pub id: String,
    pub modality: Option<String>,
    pub description: Option<String>,
    pub series_number: Option<String>,
    pub instances: Option<Vec<InstanceId>>,
}

/// 影像数据源
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// 获取单个实例的预览图
    async fn fetch_preview(&self, instance: &InstanceId) -> Result<Preview, UpstreamError>;
}

/// 元数据源
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// 获取检查下的序列列表
    async fn study_series(&self, study: &StudyId) -> Result<Vec<SeriesDescriptor>, UpstreamError>;

    /// 获取序列下的实例ID列表
    async fn series_instances(&self, series_id: &str) -> Result<Vec<InstanceId>, UpstreamError>;

    /// 获取检查的结构化元数据（OHIF DICOM JSON）
    async fn study_dicom_json(&self, study: &StudyId) -> Result<Value, UpstreamError>;
}
