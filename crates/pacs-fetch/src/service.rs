//! 获取服务
//!
//! HTTP层调用的唯一入口，组合检查解析、元数据缓存、批量编排、去重和进度跟踪。

use pacs_cache::{clear_all, collect_stats, CacheConfig, CacheStats, ImageCache, InFlight, MetadataCache};
use pacs_core::utils::validate_identifier;
use pacs_core::{
    flatten_instances, BatchResult, CacheStatus, FetchResult, InstanceId, PacsError, Result, Series, StudyId,
};
use pacs_orthanc::{ImageSource, InstanceFetcher, MetadataSource, OrthancClient, RetryPolicy, StudyResolver};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::metrics::FetchMetrics;
use crate::orchestrator::{BatchOrchestrator, Deadline, OrchestratorConfig};
use crate::progress::{ProgressRegistry, ProgressReporter, StudyProgress};

/// 服务配置
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub orchestrator: OrchestratorConfig,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    /// 单个上游请求的超时
    pub request_timeout: Duration,
    /// 所有批次共享的上游连接数上限
    pub max_upstream_connections: usize,
    /// 已结束检查的进度保留时间
    pub progress_retention: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            max_upstream_connections: 64,
            progress_retention: Duration::from_secs(3600),
        }
    }
}

/// 整个检查的获取结果，去重时在所有等待方之间共享
#[derive(Debug, Clone)]
pub struct StudyFetch {
    pub study_id: StudyId,
    pub series: Arc<Vec<Series>>,
    pub batch: BatchResult,
    pub cache_status: CacheStatus,
}

/// 缓存与进行中请求的统计
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub in_flight_studies: usize,
    pub in_flight_instances: usize,
    pub tracked_studies: usize,
}

/// 获取服务
pub struct FetchService {
    resolver: StudyResolver,
    metadata_cache: MetadataCache,
    image_cache: Arc<ImageCache>,
    orchestrator: BatchOrchestrator,
    studies: InFlight<StudyId, Result<Arc<StudyFetch>>>,
    instances: Arc<InFlight<InstanceId, FetchResult>>,
    progress: Arc<ProgressRegistry>,
    metrics: Arc<FetchMetrics>,
}

impl FetchService {
    pub fn new(
        config: ServiceConfig,
        images: Arc<dyn ImageSource>,
        metadata: Arc<dyn MetadataSource>,
    ) -> Result<Self> {
        let metrics = Arc::new(FetchMetrics::new()?);
        let image_cache = Arc::new(ImageCache::new(config.cache.clone()));
        let instances = Arc::new(InFlight::new());
        let fetcher = Arc::new(InstanceFetcher::new(
            images,
            config.retry.clone(),
            config.request_timeout,
            config.max_upstream_connections,
        ));
        let orchestrator = BatchOrchestrator::new(
            fetcher,
            Arc::clone(&image_cache),
            Arc::clone(&instances),
            Arc::clone(&metrics),
            config.orchestrator.clone(),
        );

        Ok(Self {
            resolver: StudyResolver::new(metadata),
            metadata_cache: MetadataCache::new(&config.cache),
            image_cache,
            orchestrator,
            studies: InFlight::new(),
            instances,
            progress: Arc::new(ProgressRegistry::new(config.progress_retention)),
            metrics,
        })
    }

    /// 以Orthanc客户端同时作为影像源和元数据源
    pub fn with_orthanc(config: ServiceConfig, client: OrthancClient) -> Result<Self> {
        let client = Arc::new(client);
        Self::new(config, client.clone(), client)
    }

    /// 获取整个检查
    ///
    /// 同一检查的并发请求共享一次解析和一组上游获取。截止时间从收到请求开始计算，
    /// 包含元数据解析。跟随者最多等待到自己的截止时间，之后返回缓存中已有的部分结果，
    /// 共享的获取继续为其他等待方进行。
    pub async fn fetch_study(self: &Arc<Self>, study: StudyId, timeout: Option<Duration>) -> Result<Arc<StudyFetch>> {
        validate_identifier("studyId", study.as_str())?;
        let deadline = self.orchestrator.deadline(timeout);

        let service = Arc::clone(self);
        let key = study.clone();
        let (joined, handle) = self
            .studies
            .acquire(study.clone(), move || async move { service.run_study(key, deadline).await });

        if !joined {
            return handle.wait().await;
        }

        info!("Study {} already loading, waiting for existing request", study);
        self.metrics.record_dedup_join("study");

        match tokio::time::timeout_at(deadline.at, handle.wait()).await {
            Ok(result) => result,
            Err(_) => self.partial_study(&study, deadline).await,
        }
    }

    /// 跟随者超时后由缓存拼出的部分结果，实例列表尚未解析时返回超时错误
    async fn partial_study(&self, study: &StudyId, deadline: Deadline) -> Result<Arc<StudyFetch>> {
        let series = self
            .metadata_cache
            .get(study)
            .await
            .ok_or_else(|| deadline_exceeded(study, deadline))?;
        let instances = flatten_instances(&series);

        let batch = self.orchestrator.collect_cached(&instances, deadline).await;
        let cache_status = CacheStatus::for_study(true, batch.cache_hits, batch.total_requested);
        self.metrics.record_study(cache_status);
        warn!(
            "Study {} still loading after {:.1}s, returning {}/{} cached images",
            study,
            deadline.budget.as_secs_f64(),
            batch.success_count,
            batch.total_requested
        );

        Ok(Arc::new(StudyFetch {
            study_id: study.clone(),
            series,
            batch,
            cache_status,
        }))
    }

    async fn run_study(&self, study: StudyId, deadline: Deadline) -> Result<Arc<StudyFetch>> {
        info!("Fetching study: {}", study);
        let reporter = self.progress.start(&study);

        match self.load_study(&study, deadline, &reporter).await {
            Ok(fetch) => {
                reporter.finish(&fetch.batch);
                Ok(Arc::new(fetch))
            }
            Err(err) => {
                error!(study = %study, kind = err.kind(), "study fetch failed: {}", err);
                reporter.fail(&err);
                Err(err)
            }
        }
    }

    async fn load_study(
        &self,
        study: &StudyId,
        deadline: Deadline,
        reporter: &ProgressReporter,
    ) -> Result<StudyFetch> {
        let (series, metadata_hit) = tokio::time::timeout_at(deadline.at, self.resolve_cached(study))
            .await
            .map_err(|_| deadline_exceeded(study, deadline))??;
        let instances = flatten_instances(&series);
        reporter.set_total(instances.len());

        let batch = self
            .orchestrator
            .fetch_batch_until(&instances, deadline, Some(reporter))
            .await;
        ensure_authorized(&batch)?;

        let cache_status = CacheStatus::for_study(metadata_hit, batch.cache_hits, batch.total_requested);
        self.metrics.record_study(cache_status);
        info!(
            "Successfully processed study {}: {}/{} images ({})",
            study, batch.success_count, batch.total_requested, cache_status
        );

        Ok(StudyFetch {
            study_id: study.clone(),
            series,
            batch,
            cache_status,
        })
    }

    async fn resolve_cached(&self, study: &StudyId) -> Result<(Arc<Vec<Series>>, bool)> {
        self.metadata_cache
            .get_or_resolve(study, self.resolver.resolve(study))
            .await
    }

    /// 获取一组显式指定的实例
    pub async fn fetch_instances(&self, instances: Vec<InstanceId>, timeout: Option<Duration>) -> Result<BatchResult> {
        if instances.is_empty() {
            return Err(PacsError::MalformedRequest("instanceIds must not be empty".to_string()));
        }
        for id in &instances {
            validate_identifier("instanceId", id.as_str())?;
        }

        info!("Fetching {} instances", instances.len());
        let batch = self.orchestrator.fetch_batch(&instances, timeout, None).await;
        ensure_authorized(&batch)?;
        info!("Instances batch served ({})", batch.cache_status());

        Ok(batch)
    }

    /// 检查的序列列表
    pub async fn study_series(&self, study: &StudyId) -> Result<Arc<Vec<Series>>> {
        validate_identifier("studyId", study.as_str())?;
        let (series, _) = self.resolve_cached(study).await?;
        Ok(series)
    }

    /// 单个实例的预览图，失败时结果中带错误信息
    pub async fn instance_preview(&self, instance: &InstanceId) -> Result<FetchResult> {
        validate_identifier("instanceId", instance.as_str())?;

        let result = self.orchestrator.fetch_single(instance).await;
        if result.auth_rejected {
            return Err(PacsError::UpstreamAuth(format!(
                "upstream rejected credentials for instance {}",
                instance
            )));
        }

        Ok(result)
    }

    /// 检查的代表图：第一个包含实例的序列的第一个实例
    pub async fn study_preview(&self, study: &StudyId) -> Result<FetchResult> {
        let series = self.study_series(study).await?;
        let first = series
            .iter()
            .find_map(|s| s.instances.first())
            .cloned()
            .ok_or_else(|| PacsError::StudyNotFound(format!("study {} has no instances", study)))?;

        self.instance_preview(&first).await
    }

    /// 检查的结构化元数据（OHIF DICOM JSON）
    pub async fn study_metadata(&self, study: &StudyId) -> Result<Value> {
        validate_identifier("studyId", study.as_str())?;
        self.resolver.dicom_json(study).await
    }

    pub fn progress(&self, study: &StudyId) -> Option<StudyProgress> {
        self.progress.get(study)
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: collect_stats(&self.image_cache, &self.metadata_cache).await,
            in_flight_studies: self.studies.len(),
            in_flight_instances: self.instances.len(),
            tracked_studies: self.progress.len(),
        }
    }

    /// 清空影像与元数据缓存，进行中的请求不受影响
    pub fn clear_caches(&self) {
        clear_all(&self.image_cache, &self.metadata_cache);
    }

    pub fn metrics(&self) -> &FetchMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &OrchestratorConfig {
        self.orchestrator.config()
    }
}

fn deadline_exceeded(study: &StudyId, deadline: Deadline) -> PacsError {
    PacsError::Timeout(format!(
        "study {} not resolved within {:.1}s",
        study,
        deadline.budget.as_secs_f64()
    ))
}

/// 任一实例因凭据被拒绝而失败时，整个请求失败
fn ensure_authorized(batch: &BatchResult) -> Result<()> {
    if batch.auth_failures > 0 {
        return Err(PacsError::UpstreamAuth(format!(
            "upstream rejected credentials for {} of {} instances",
            batch.auth_failures, batch.total_requested
        )));
    }
    Ok(())
}
