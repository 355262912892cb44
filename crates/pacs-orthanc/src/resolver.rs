//! 检查/序列解析
//!
//! 元数据查询失败对整个检查是致命的，与单个实例获取失败（可恢复）严格区分。

use futures::future::try_join_all;
use pacs_core::{PacsError, Result, Series, StudyId};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::UpstreamError;
use crate::source::MetadataSource;

pub struct StudyResolver {
    source: Arc<dyn MetadataSource>,
}

impl StudyResolver {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self { source }
    }

    /// 将检查解析为有序的序列列表
    ///
    /// 上游未内联实例列表的序列会单独查询，各序列的查询并发进行但结果保持原顺序。
    pub async fn resolve(&self, study: &StudyId) -> Result<Vec<Series>> {
        let descriptors = self
            .source
            .study_series(study)
            .await
            .map_err(|e| study_error(study, e))?;

        let series = try_join_all(descriptors.into_iter().map(|descriptor| async move {
            let instances = match descriptor.instances {
                Some(instances) => instances,
                None => self
                    .source
                    .series_instances(&descriptor.id)
                    .await
                    .map_err(|e| series_error(study, &descriptor.id, e))?,
            };

            Ok::<_, PacsError>(Series {
                id: descriptor.id,
                modality: descriptor.modality,
                description: descriptor.description,
                series_number: descriptor.series_number,
                instances,
            })
        }))
        .await?;

        let total: usize = series.iter().map(Series::instance_count).sum();
        info!(study = %study, series = series.len(), instances = total, "Found {} instances for study {}", total, study);

        Ok(series)
    }

    /// 获取检查的OHIF DICOM JSON元数据
    pub async fn dicom_json(&self, study: &StudyId) -> Result<Value> {
        self.source
            .study_dicom_json(study)
            .await
            .map_err(|e| study_error(study, e))
    }
}

fn study_error(study: &StudyId, err: UpstreamError) -> PacsError {
    match err {
        UpstreamError::Status { status: 404 } => PacsError::StudyNotFound(study.to_string()),
        other => metadata_error(format!("study {}", study), other),
    }
}

fn series_error(study: &StudyId, series_id: &str, err: UpstreamError) -> PacsError {
    metadata_error(format!("series {} of study {}", series_id, study), err)
}

fn metadata_error(context: String, err: UpstreamError) -> PacsError {
    if err.is_auth_rejected() {
        error!("Upstream rejected credentials while resolving {}: {}", context, err);
        return PacsError::UpstreamAuth(format!("{}: {}", context, err));
    }

    match err {
        UpstreamError::Transport(_) | UpstreamError::Timeout(_) => {
            PacsError::UpstreamUnavailable(format!("{}: {}", context, err))
        }
        other => PacsError::MetadataResolution(format!("{}: {}", context, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SeriesDescriptor;
    use async_trait::async_trait;
    use pacs_core::InstanceId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockMetadata {
        series: std::result::Result<Vec<SeriesDescriptor>, UpstreamError>,
        instances_calls: AtomicUsize,
    }

    impl MockMetadata {
        fn new(series: std::result::Result<Vec<SeriesDescriptor>, UpstreamError>) -> Arc<Self> {
            Arc::new(Self {
                series,
                instances_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MetadataSource for MockMetadata {
        async fn study_series(
            &self,
            _study: &StudyId,
        ) -> std::result::Result<Vec<SeriesDescriptor>, UpstreamError> {
            self.series.clone()
        }

        async fn series_instances(
            &self,
            series_id: &str,
        ) -> std::result::Result<Vec<InstanceId>, UpstreamError> {
            self.instances_calls.fetch_add(1, Ordering::SeqCst);
            if series_id == "broken" {
                return Err(UpstreamError::Status { status: 500 });
            }
            Ok(vec![format!("{}-1", series_id).into(), format!("{}-2", series_id).into()])
        }

        async fn study_dicom_json(&self, _study: &StudyId) -> std::result::Result<Value, UpstreamError> {
            Ok(serde_json::json!({"studies": []}))
        }
    }

    fn descriptor(id: &str, instances: Option<Vec<&str>>) -> SeriesDescriptor {
        SeriesDescriptor {
            id: id.to_string(),
            modality: Some("MR".to_string()),
            description: None,
            series_number: None,
            instances: instances.map(|ids| ids.into_iter().map(InstanceId::from).collect()),
        }
    }

    #[tokio::test]
    async fn test_resolve_keeps_order() {
        let source = MockMetadata::new(Ok(vec![
            descriptor("s1", Some(vec!["a", "b"])),
            descriptor("s2", None),
            descriptor("s3", Some(vec![])),
        ]));
        let resolver = StudyResolver::new(source.clone());

        let series = resolver.resolve(&"study".into()).await.unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].instances, vec![InstanceId::from("a"), "b".into()]);
        assert_eq!(series[1].instances, vec![InstanceId::from("s2-1"), "s2-2".into()]);
        assert!(series[2].instances.is_empty());
        assert_eq!(source.instances_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let resolver = StudyResolver::new(MockMetadata::new(Err(UpstreamError::Status { status: 404 })));
        let err = resolver.resolve(&"missing".into()).await.unwrap_err();
        assert_eq!(err, PacsError::StudyNotFound("missing".to_string()));

        let resolver = StudyResolver::new(MockMetadata::new(Err(UpstreamError::Status { status: 401 })));
        let err = resolver.resolve(&"s".into()).await.unwrap_err();
        assert!(matches!(err, PacsError::UpstreamAuth(_)));

        let resolver = StudyResolver::new(MockMetadata::new(Err(UpstreamError::Transport(
            "connection refused".to_string(),
        ))));
        let err = resolver.resolve(&"s".into()).await.unwrap_err();
        assert!(matches!(err, PacsError::UpstreamUnavailable(_)));

        let resolver = StudyResolver::new(MockMetadata::new(Err(UpstreamError::Decode("eof".to_string()))));
        let err = resolver.resolve(&"s".into()).await.unwrap_err();
        assert!(matches!(err, PacsError::MetadataResolution(_)));
    }

    #[tokio::test]
    async fn test_series_failure_fails_study() {
        let source = MockMetadata::new(Ok(vec![descriptor("ok", None), descriptor("broken", None)]));
        let resolver = StudyResolver::new(source);

        let err = resolver.resolve(&"study".into()).await.unwrap_err();
        match err {
            PacsError::MetadataResolution(msg) => assert!(msg.contains("series broken")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
