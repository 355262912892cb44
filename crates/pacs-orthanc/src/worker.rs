//! 单实例获取

use pacs_core::{FetchResult, InstanceId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::error::UpstreamError;
use crate::source::{ImageSource, Preview};

/// 重试策略，退避时间按次数翻倍
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次重试前的等待时间（从0开始）
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// 实例获取器
///
/// 所有失败都被记录进 `FetchResult`，不会向外抛出。
/// `permits` 在所有批次之间共享，限制同时发往上游的影像请求数。
pub struct InstanceFetcher {
    source: Arc<dyn ImageSource>,
    retry: RetryPolicy,
    request_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl InstanceFetcher {
    pub fn new(
        source: Arc<dyn ImageSource>,
        retry: RetryPolicy,
        request_timeout: Duration,
        max_connections: usize,
    ) -> Self {
        Self {
            source,
            retry,
            request_timeout,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    /// 获取单个实例的预览图
    pub async fn fetch(&self, instance: &InstanceId) -> FetchResult {
        let mut attempt = 0;

        loop {
            match self.attempt(instance).await {
                Ok(preview) => {
                    debug!(instance = %instance, bytes = preview.payload.len(), "instance fetched");
                    return FetchResult::success(instance.clone(), preview.payload, preview.content_type);
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff_for(attempt);
                    debug!(instance = %instance, attempt, error = %err, "retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_auth_rejected() => {
                    error!(instance = %instance, error = %err, "upstream rejected credentials, check ORTHANC credentials");
                    return FetchResult::auth_failure(instance.clone(), err.to_string())
                        .with_upstream_status(err.status());
                }
                Err(err) => {
                    warn!(instance = %instance, attempts = attempt + 1, error = %err, "instance fetch failed");
                    return FetchResult::failure(instance.clone(), err.to_string())
                        .with_upstream_status(err.status());
                }
            }
        }
    }

    async fn attempt(&self, instance: &InstanceId) -> Result<Preview, UpstreamError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::Transport("upstream limiter closed".to_string()))?;

        match tokio::time::timeout(self.request_timeout, self.source.fetch_preview(instance)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(format!(
                "no response within {:.1}s",
                self.request_timeout.as_secs_f64()
            ))),
        }
    }

    /// 当前可用的上游连接数
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}
