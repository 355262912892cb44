//! 检查获取进度跟踪

use chrono::{DateTime, Utc};
use pacs_core::{BatchResult, FetchResult, PacsError, StudyId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// 进度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    /// 正在解析序列与实例列表
    Resolving,
    /// 正在获取影像
    Fetching,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }
}

/// 单个检查的获取进度
#[derive(Debug, Clone, Serialize)]
pub struct StudyProgress {
    pub study_id: StudyId,
    pub status: ProgressStatus,
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub cache_hits: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StudyProgress {
    fn new(study_id: StudyId) -> Self {
        let now = Utc::now();
        Self {
            study_id,
            status: ProgressStatus::Resolving,
            total: 0,
            completed: 0,
            successful: 0,
            failed: 0,
            cache_hits: 0,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// 完成百分比
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return if self.status.is_finished() { 100.0 } else { 0.0 };
        }
        self.completed as f64 * 100.0 / self.total as f64
    }
}

/// 进度表
///
/// 已结束的条目保留 `retention` 后在下一次写入时清理。
pub struct ProgressRegistry {
    entries: Mutex<HashMap<StudyId, StudyProgress>>,
    retention: Duration,
}

impl ProgressRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<StudyId, StudyProgress>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 开始跟踪一个检查，覆盖之前的记录
    pub fn start(self: &Arc<Self>, study: &StudyId) -> ProgressReporter {
        let mut entries = self.entries();
        self.prune(&mut entries);
        entries.insert(study.clone(), StudyProgress::new(study.clone()));

        ProgressReporter {
            registry: Arc::clone(self),
            study: study.clone(),
        }
    }

    fn prune(&self, entries: &mut HashMap<StudyId, StudyProgress>) {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::hours(1));
        let cutoff = Utc::now() - retention;
        entries.retain(|_, progress| !progress.status.is_finished() || progress.updated_at > cutoff);
    }

    fn update(&self, study: &StudyId, apply: impl FnOnce(&mut StudyProgress)) {
        if let Some(progress) = self.entries().get_mut(study) {
            apply(progress);
            progress.updated_at = Utc::now();
        }
    }

    pub fn get(&self, study: &StudyId) -> Option<StudyProgress> {
        self.entries().get(study).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 单个检查的进度上报器
#[derive(Clone)]
pub struct ProgressReporter {
    registry: Arc<ProgressRegistry>,
    study: StudyId,
}

impl ProgressReporter {
    pub fn study(&self) -> &StudyId {
        &self.study
    }

    /// 实例列表解析完成
    pub fn set_total(&self, total: usize) {
        self.registry.update(&self.study, |p| {
            p.status = ProgressStatus::Fetching;
            p.total = total;
        });
    }

    pub fn record(&self, result: &FetchResult) {
        self.registry.update(&self.study, |p| {
            p.completed += 1;
            if result.success {
                p.successful += 1;
            } else {
                p.failed += 1;
            }
            if result.from_cache {
                p.cache_hits += 1;
            }
        });
    }

    /// 用批次汇总结果收尾，覆盖逐个上报的计数
    pub fn finish(&self, batch: &BatchResult) {
        self.registry.update(&self.study, |p| {
            p.status = ProgressStatus::Completed;
            p.total = batch.total_requested;
            p.completed = batch.total_requested;
            p.successful = batch.success_count;
            p.failed = batch.failure_count;
            p.cache_hits = batch.cache_hits;
        });
    }

    pub fn fail(&self, err: &PacsError) {
        self.registry.update(&self.study, |p| {
            p.status = ProgressStatus::Failed;
            p.error = Some(err.to_string());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_progress_lifecycle() {
        let registry = Arc::new(ProgressRegistry::new(Duration::from_secs(3600)));
        let study = StudyId::from("s1");
        let reporter = registry.start(&study);

        let progress = registry.get(&study).unwrap();
        assert_eq!(progress.status, ProgressStatus::Resolving);
        assert_eq!(progress.percent(), 0.0);

        reporter.set_total(4);
        reporter.record(&FetchResult::success("a".into(), Bytes::from_static(b"x"), "image/png"));
        reporter.record(&FetchResult::failure("b".into(), "HTTP 404"));

        let progress = registry.get(&study).unwrap();
        assert_eq!(progress.status, ProgressStatus::Fetching);
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.successful, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.percent(), 50.0);

        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["study_id"], "s1");
        assert_eq!(json["status"], "fetching");
    }

    #[test]
    fn test_failure_is_recorded() {
        let registry = Arc::new(ProgressRegistry::new(Duration::from_secs(3600)));
        let study = StudyId::from("s1");
        registry
            .start(&study)
            .fail(&PacsError::StudyNotFound("s1".to_string()));

        let progress = registry.get(&study).unwrap();
        assert_eq!(progress.status, ProgressStatus::Failed);
        assert!(progress.error.as_deref().unwrap().contains("s1"));
        assert_eq!(progress.percent(), 100.0);
    }

    #[test]
    fn test_finished_entries_are_pruned() {
        let registry = Arc::new(ProgressRegistry::new(Duration::ZERO));
        registry.start(&"done".into()).finish(&BatchResult::empty());
        let _running = registry.start(&"running".into());
        assert!(registry.get(&"done".into()).is_none());

        registry.start(&"other".into());
        assert!(registry.get(&"running".into()).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_study() {
        let registry = ProgressRegistry::new(Duration::from_secs(60));
        assert!(registry.get(&"nope".into()).is_none());
        assert!(registry.is_empty());
    }
}
