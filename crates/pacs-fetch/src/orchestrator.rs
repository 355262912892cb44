//! 批量获取编排
//!
//! 先查缓存，未命中的实例以有界并发发往上游。结果按请求顺序写回，
//! 批次截止时间到达时丢弃所有未完成的获取，对应位置记为失败。

use futures::stream::{self, StreamExt};
use pacs_cache::{ImageCache, InFlight};
use pacs_core::{BatchResult, FetchResult, InstanceId};
use pacs_orthanc::InstanceFetcher;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::metrics::FetchMetrics;
use crate::progress::ProgressReporter;

/// 每完成多少个实例输出一次进度日志
const PROGRESS_LOG_INTERVAL: usize = 100;

/// 编排配置
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 单个批次内同时进行的获取数
    pub max_concurrency: usize,
    /// 批次截止时间（请求指定的超时不能超过它）
    pub batch_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            batch_timeout: Duration::from_secs(120),
        }
    }
}

/// 批次截止时间
///
/// `budget` 是调用方得到的总时长，用于生成取消信息。
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub at: Instant,
    pub budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.budget.saturating_sub(self.remaining())
    }

    pub fn cancellation_message(&self) -> String {
        format!(
            "cancelled: batch deadline of {:.1}s exceeded",
            self.budget.as_secs_f64()
        )
    }
}

/// 批量获取编排器
pub struct BatchOrchestrator {
    fetcher: Arc<InstanceFetcher>,
    cache: Arc<ImageCache>,
    inflight: Arc<InFlight<InstanceId, FetchResult>>,
    metrics: Arc<FetchMetrics>,
    config: OrchestratorConfig,
}

impl BatchOrchestrator {
    pub fn new(
        fetcher: Arc<InstanceFetcher>,
        cache: Arc<ImageCache>,
        inflight: Arc<InFlight<InstanceId, FetchResult>>,
        metrics: Arc<FetchMetrics>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            fetcher,
            cache,
            inflight,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// 实际生效的批次超时
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(timeout) if !timeout.is_zero() => timeout.min(self.config.batch_timeout),
            _ => self.config.batch_timeout,
        }
    }

    /// 从现在开始计算的截止时间
    pub fn deadline(&self, requested: Option<Duration>) -> Deadline {
        Deadline::after(self.effective_timeout(requested))
    }

    /// 批量获取实例
    ///
    /// 不会返回错误：每个实例的失败都记录在对应的 `FetchResult` 中，
    /// 返回的 `results` 与 `instances` 一一对应且顺序相同。
    pub async fn fetch_batch(
        &self,
        instances: &[InstanceId],
        timeout: Option<Duration>,
        progress: Option<&ProgressReporter>,
    ) -> BatchResult {
        self.fetch_batch_until(instances, self.deadline(timeout), progress)
            .await
    }

    /// 在给定截止时间前批量获取，截止时间可能已被之前的步骤消耗一部分
    pub async fn fetch_batch_until(
        &self,
        instances: &[InstanceId],
        deadline: Deadline,
        progress: Option<&ProgressReporter>,
    ) -> BatchResult {
        let batch_id = Uuid::new_v4();
        let span = info_span!("batch", %batch_id, instances = instances.len());

        self.run_batch(instances, deadline, progress)
            .instrument(span)
            .await
    }

    async fn run_batch(
        &self,
        instances: &[InstanceId],
        deadline: Deadline,
        progress: Option<&ProgressReporter>,
    ) -> BatchResult {
        let started = Instant::now();
        let total = instances.len();

        if total == 0 {
            return BatchResult::empty();
        }

        let mut slots: Vec<Option<FetchResult>> = vec![None; total];
        // 未命中的实例按首次出现顺序去重，重复的位置共享同一次获取
        let mut misses: Vec<InstanceId> = Vec::new();
        let mut positions: HashMap<InstanceId, Vec<usize>> = HashMap::new();
        let mut first_seen: HashMap<&InstanceId, usize> = HashMap::new();

        for (index, id) in instances.iter().enumerate() {
            if let Some(&first) = first_seen.get(id) {
                if let Some(cached) = slots[first].clone() {
                    if let Some(progress) = progress {
                        progress.record(&cached);
                    }
                    slots[index] = Some(cached);
                } else {
                    positions.entry(id.clone()).or_default().push(index);
                }
                continue;
            }
            first_seen.insert(id, index);

            match self.cache.get(id).await {
                Some(entry) => {
                    let result = entry.to_result();
                    if let Some(progress) = progress {
                        progress.record(&result);
                    }
                    slots[index] = Some(result);
                }
                None => {
                    misses.push(id.clone());
                    positions.insert(id.clone(), vec![index]);
                }
            }
        }

        let mut completed = slots.iter().filter(|slot| slot.is_some()).count();
        debug!(cached = completed, to_fetch = misses.len(), "cache lookup finished");

        let mut timed_out = false;
        if !misses.is_empty() {
            let mut pending = stream::iter(misses.into_iter().map(|id| async move {
                let result = self.fetch_one(id.clone()).await;
                (id, result)
            }))
            .buffer_unordered(self.config.max_concurrency.max(1));

            loop {
                match tokio::time::timeout_at(deadline.at, pending.next()).await {
                    Ok(Some((id, result))) => {
                        for &index in positions.get(&id).into_iter().flatten() {
                            if let Some(progress) = progress {
                                progress.record(&result);
                            }
                            slots[index] = Some(result.clone());
                            completed += 1;

                            if completed % PROGRESS_LOG_INTERVAL == 0 {
                                info!("Progress: {}/{} images processed", completed, total);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        timed_out = true;
                        warn!(
                            completed,
                            total,
                            "批次超时，放弃剩余 {} 个实例",
                            total - completed
                        );
                        break;
                    }
                }
            }
            // 丢弃未完成的获取，取消对应的上游请求
            drop(pending);
        }

        let cancelled = deadline.cancellation_message();
        let results: Vec<FetchResult> = slots
            .into_iter()
            .zip(instances)
            .map(|(slot, id)| slot.unwrap_or_else(|| FetchResult::failure(id.clone(), cancelled.clone())))
            .collect();

        let batch = BatchResult::from_results(results, started.elapsed(), timed_out);

        self.metrics.record_instances(
            batch.cache_hits,
            batch.success_count - batch.cache_hits,
            batch.failure_count,
        );
        self.metrics.observe_batch(batch.processing_time_secs, timed_out);

        info!(
            "Batch fetch completed: {}/{} successful, {} from cache, {:.2}s",
            batch.success_count, batch.total_requested, batch.cache_hits, batch.processing_time_secs
        );

        batch
    }

    /// 获取单个未缓存的实例，同一实例的并发获取合并为一次上游请求
    pub async fn fetch_one(&self, id: InstanceId) -> FetchResult {
        let fetcher = Arc::clone(&self.fetcher);
        let cache = Arc::clone(&self.cache);
        let key = id.clone();

        let (joined, handle) = self.inflight.acquire(id.clone(), move || async move {
            let result = fetcher.fetch(&key).await;
            cache.put_result(&result).await;
            result
        });

        if joined {
            debug!(instance = %id, "joined in-flight fetch");
            self.metrics.record_dedup_join("instance");
        }

        handle.wait().await
    }

    /// 只从缓存取结果，不发起上游请求，未缓存的实例记为已取消
    ///
    /// 用于等待他人进行中的获取超时后，尽力返回已有的部分结果。
    pub async fn collect_cached(&self, instances: &[InstanceId], deadline: Deadline) -> BatchResult {
        let cancelled = deadline.cancellation_message();
        let mut results = Vec::with_capacity(instances.len());
        for id in instances {
            let result = match self.cache.get(id).await {
                Some(entry) => entry.to_result(),
                None => FetchResult::failure(id.clone(), cancelled.clone()),
            };
            results.push(result);
        }

        let batch = BatchResult::from_results(results, deadline.elapsed(), true);
        self.metrics.observe_batch(batch.processing_time_secs, true);
        warn!(
            "Returning partial batch after deadline: {}/{} cached",
            batch.cache_hits, batch.total_requested
        );
        batch
    }

    /// 先查缓存再获取单个实例
    pub async fn fetch_single(&self, id: &InstanceId) -> FetchResult {
        match self.cache.get(id).await {
            Some(entry) => entry.to_result(),
            None => self.fetch_one(id.clone()).await,
        }
    }
}
