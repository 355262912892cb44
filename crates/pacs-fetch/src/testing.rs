//! 测试用的内存上游

use async_trait::async_trait;
use bytes::Bytes;
use pacs_core::{InstanceId, StudyId};
use pacs_orthanc::{ImageSource, MetadataSource, Preview, SeriesDescriptor, UpstreamError};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MockPacs {
    studies: HashMap<String, Vec<SeriesDescriptor>>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    metadata_delay: Option<Duration>,
    missing: HashSet<String>,
    unauthorized: bool,
    image_calls: Mutex<HashMap<String, usize>>,
    metadata_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockPacs {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一个检查，每个序列由 (序列ID, 实例ID列表) 描述
    pub fn with_study(mut self, study: &str, series: &[(&str, &[&str])]) -> Self {
        let descriptors = series
            .iter()
            .map(|(id, instances)| SeriesDescriptor {
                id: id.to_string(),
                modality: Some("CT".to_string()),
                description: None,
                series_number: None,
                instances: Some(instances.iter().map(|i| InstanceId::from(*i)).collect()),
            })
            .collect();
        self.studies.insert(study.to_string(), descriptors);
        self
    }

    pub fn with_delay(mut self, instance: &str, delay: Duration) -> Self {
        self.delays.insert(instance.to_string(), delay);
        self
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn with_metadata_delay(mut self, delay: Duration) -> Self {
        self.metadata_delay = Some(delay);
        self
    }

    /// 该实例返回404
    pub fn with_missing(mut self, instance: &str) -> Self {
        self.missing.insert(instance.to_string());
        self
    }

    /// 所有影像请求返回401
    pub fn unauthorized(mut self) -> Self {
        self.unauthorized = true;
        self
    }

    pub fn image_calls(&self, instance: &str) -> usize {
        let calls = self.image_calls.lock().unwrap();
        calls.get(instance).copied().unwrap_or(0)
    }

    pub fn total_image_calls(&self) -> usize {
        self.image_calls.lock().unwrap().values().sum()
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn png_for(instance: &str) -> Bytes {
    Bytes::from(format!("png:{}", instance))
}

#[async_trait]
impl ImageSource for MockPacs {
    async fn fetch_preview(&self, instance: &InstanceId) -> Result<Preview, UpstreamError> {
        *self
            .image_calls
            .lock()
            .unwrap()
            .entry(instance.to_string())
            .or_insert(0) += 1;

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let delay = self
            .delays
            .get(instance.as_str())
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.unauthorized {
            return Err(UpstreamError::Status { status: 401 });
        }
        if self.missing.contains(instance.as_str()) {
            return Err(UpstreamError::Status { status: 404 });
        }

        Ok(Preview {
            payload: png_for(instance.as_str()),
            content_type: "image/png".to_string(),
        })
    }
}

#[async_trait]
impl MetadataSource for MockPacs {
    async fn study_series(&self, study: &StudyId) -> Result<Vec<SeriesDescriptor>, UpstreamError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.metadata_delay.unwrap_or(Duration::from_millis(5))).await;

        self.studies
            .get(study.as_str())
            .cloned()
            .ok_or(UpstreamError::Status { status: 404 })
    }

    async fn series_instances(&self, _series_id: &str) -> Result<Vec<InstanceId>, UpstreamError> {
        Err(UpstreamError::Status { status: 404 })
    }

    async fn study_dicom_json(&self, study: &StudyId) -> Result<Value, UpstreamError> {
        if !self.studies.contains_key(study.as_str()) {
            return Err(UpstreamError::Status { status: 404 });
        }
        Ok(json!({ "studies": [{ "StudyInstanceUID": study.as_str() }] }))
    }
}
