//! # PACS批量获取模块
//!
//! 把检查解析、缓存、去重和并发获取组合为完整的获取流程：
//! - 有界并发的批量获取编排
//! - 检查级与实例级的请求去重
//! - 按检查的进度跟踪
//! - Prometheus指标

pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use metrics::FetchMetrics;
pub use orchestrator::{BatchOrchestrator, Deadline, OrchestratorConfig};
pub use progress::{ProgressRegistry, ProgressReporter, ProgressStatus, StudyProgress};
pub use service::{FetchService, ServiceConfig, ServiceStats, StudyFetch};
