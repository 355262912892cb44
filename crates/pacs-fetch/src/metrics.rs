//! 获取服务指标

use pacs_core::{CacheStatus, PacsError, Result};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// 获取服务指标收集器
#[derive(Debug)]
pub struct FetchMetrics {
    /// Prometheus指标注册表
    registry: Registry,
    /// 实例获取结果计数（success/failure/cached）
    instance_fetches: IntCounterVec,
    /// 去重合并的请求数（study/instance）
    dedup_joins: IntCounterVec,
    /// 检查请求按缓存状态计数
    study_requests: IntCounterVec,
    /// 批次耗时
    batch_duration: Histogram,
    /// 超时的批次数
    batch_timeouts: IntCounter,
}

impl FetchMetrics {
    pub fn new() -> Result<Self> {
        Self::build().map_err(|e| PacsError::Internal(format!("failed to register metrics: {}", e)))
    }

    fn build() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let instance_fetches = IntCounterVec::new(
            Opts::new("instance_fetches_total", "Instance fetch results by outcome"),
            &["outcome"],
        )?;

        let dedup_joins = IntCounterVec::new(
            Opts::new("dedup_joins_total", "Requests that joined an in-flight fetch"),
            &["scope"],
        )?;

        let study_requests = IntCounterVec::new(
            Opts::new("study_requests_total", "Study fetches by cache status"),
            &["cache_status"],
        )?;

        let batch_duration = Histogram::with_opts(
            HistogramOpts::new("batch_duration_seconds", "Batch fetch duration in seconds")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;

        let batch_timeouts = IntCounter::with_opts(Opts::new(
            "batch_timeouts_total",
            "Batches that hit their deadline",
        ))?;

        // 注册所有指标
        registry.register(Box::new(instance_fetches.clone()))?;
        registry.register(Box::new(dedup_joins.clone()))?;
        registry.register(Box::new(study_requests.clone()))?;
        registry.register(Box::new(batch_duration.clone()))?;
        registry.register(Box::new(batch_timeouts.clone()))?;

        Ok(Self {
            registry,
            instance_fetches,
            dedup_joins,
            study_requests,
            batch_duration,
            batch_timeouts,
        })
    }

    pub fn record_instances(&self, cached: usize, fetched_ok: usize, failed: usize) {
        self.instance_fetches.with_label_values(&["cached"]).inc_by(cached as u64);
        self.instance_fetches.with_label_values(&["success"]).inc_by(fetched_ok as u64);
        self.instance_fetches.with_label_values(&["failure"]).inc_by(failed as u64);
    }

    pub fn record_dedup_join(&self, scope: &str) {
        self.dedup_joins.with_label_values(&[scope]).inc();
    }

    pub fn record_study(&self, status: CacheStatus) {
        self.study_requests.with_label_values(&[status.as_str()]).inc();
    }

    pub fn observe_batch(&self, seconds: f64, timed_out: bool) {
        self.batch_duration.observe(seconds);
        if timed_out {
            self.batch_timeouts.inc();
        }
    }

    pub fn dedup_joins(&self, scope: &str) -> u64 {
        self.dedup_joins.with_label_values(&[scope]).get()
    }

    pub fn batch_timeouts(&self) -> u64 {
        self.batch_timeouts.get()
    }

    /// 获取Prometheus指标
    pub fn render(&self) -> Result<String> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PacsError::Internal(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| PacsError::Internal(e.to_string()))
    }
}
