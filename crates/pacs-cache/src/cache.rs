//! 影像与元数据缓存
//!
//! 淘汰策略：moka的TinyLFU（近似LRU），影像缓存按负载字节数计重，
//! 并对所有条目施加TTL。上游内容变化后，旧数据最多在TTL内仍会被返回。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use pacs_core::{FetchResult, InstanceId, PacsError, Result, Series, StudyId};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 缓存配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// 影像缓存容量（字节）
    pub max_bytes: u64,
    /// 条目存活时间
    pub ttl: Duration,
    /// 元数据缓存的最大检查数
    pub metadata_max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024, // 512MB
            ttl: Duration::from_secs(24 * 60 * 60),
            metadata_max_entries: 1024,
        }
    }
}

/// 缓存条目，仅在首次成功获取后创建
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: InstanceId,
    pub payload: Bytes,
    pub content_type: String,
    pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: InstanceId, payload: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            key,
            payload,
            content_type: content_type.into(),
            inserted_at: Utc::now(),
        }
    }

    /// 从成功的获取结果构造条目，失败结果返回 `None`
    pub fn from_result(result: &FetchResult) -> Option<Self> {
        match (&result.payload, result.success) {
            (Some(payload), true) => Some(Self::new(
                result.instance_id.clone(),
                payload.clone(),
                result.content_type.clone().unwrap_or_default(),
            )),
            _ => None,
        }
    }

    pub fn to_result(&self) -> FetchResult {
        FetchResult::cached(self.key.clone(), self.payload.clone(), self.content_type.clone())
    }
}

/// 缓存统计
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub valid_entries: u64,
    pub weighted_bytes: u64,
    pub max_bytes: u64,
    pub cache_ttl_hours: f64,
    pub hits: u64,
    pub misses: u64,
    pub metadata_entries: u64,
}

/// 影像缓存
pub struct ImageCache {
    entries: Cache<InstanceId, Arc<CacheEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ImageCache {
    pub fn new(config: CacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_bytes)
            .weigher(|_key: &InstanceId, entry: &Arc<CacheEntry>| -> u32 {
                entry.payload.len().try_into().unwrap_or(u32::MAX)
            })
            .time_to_live(config.ttl)
            .build();

        Self {
            entries,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &InstanceId) -> Option<Arc<CacheEntry>> {
        match self.entries.get(key).await {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn put(&self, key: InstanceId, entry: CacheEntry) {
        debug!(instance = %key, bytes = entry.payload.len(), "caching instance");
        self.entries.insert(key, Arc::new(entry)).await;
    }

    /// 缓存一个获取结果，失败结果被忽略
    pub async fn put_result(&self, result: &FetchResult) {
        if let Some(entry) = CacheEntry::from_result(result) {
            self.put(result.instance_id.clone(), entry).await;
        }
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    pub async fn stats(&self) -> (u64, u64, u64) {
        let total = self.entries.entry_count();
        self.entries.run_pending_tasks().await;
        let valid = self.entries.iter().count() as u64;
        (total, valid, self.entries.weighted_size())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// 检查元数据缓存
///
/// 同一检查的并发解析由moka合并为一次，失败结果不缓存。
pub struct MetadataCache {
    entries: Cache<StudyId, Arc<Vec<Series>>>,
}

impl MetadataCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(config.metadata_max_entries)
                .time_to_live(config.ttl)
                .build(),
        }
    }

    /// 返回序列列表，以及是否命中缓存
    pub async fn get_or_resolve<F>(&self, study: &StudyId, resolve: F) -> Result<(Arc<Vec<Series>>, bool)>
    where
        F: Future<Output = Result<Vec<Series>>>,
    {
        let entry = self
            .entries
            .entry(study.clone())
            .or_try_insert_with(async { resolve.await.map(Arc::new) })
            .await
            .map_err(|err: Arc<PacsError>| (*err).clone())?;

        let hit = !entry.is_fresh();
        if hit {
            debug!(study = %study, "metadata cache hit");
        }

        Ok((entry.into_value(), hit))
    }

    pub async fn get(&self, study: &StudyId) -> Option<Arc<Vec<Series>>> {
        self.entries.get(study).await
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

/// 汇总两个缓存的统计信息
pub async fn collect_stats(images: &ImageCache, metadata: &MetadataCache) -> CacheStats {
    let (total_entries, valid_entries, weighted_bytes) = images.stats().await;
    metadata.entries.run_pending_tasks().await;

    CacheStats {
        total_entries,
        valid_entries,
        weighted_bytes,
        max_bytes: images.config.max_bytes,
        cache_ttl_hours: images.config.ttl.as_secs_f64() / 3600.0,
        hits: images.hits(),
        misses: images.misses(),
        metadata_entries: metadata.entry_count(),
    }
}

/// 清空两个缓存
pub fn clear_all(images: &ImageCache, metadata: &MetadataCache) {
    images.clear();
    metadata.clear();
    info!("Cache cleared");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_bytes: u64, ttl: Duration) -> CacheConfig {
        CacheConfig {
            max_bytes,
            ttl,
            metadata_max_entries: 16,
        }
    }

    fn series(id: &str) -> Series {
        Series {
            id: id.to_string(),
            modality: None,
            description: None,
            series_number: None,
            instances: vec!["i1".into()],
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let cache = ImageCache::new(CacheConfig::default());
        let key = InstanceId::from("a");

        assert!(cache.get(&key).await.is_none());
        cache
            .put(key.clone(), CacheEntry::new(key.clone(), Bytes::from_static(b"png"), "image/png"))
            .await;

        let entry = cache.get(&key).await.unwrap();
        assert_eq!(&entry.payload[..], b"png");
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);

        let result = entry.to_result();
        assert!(result.success);
        assert!(result.from_cache);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = ImageCache::new(CacheConfig::default());
        cache.put_result(&FetchResult::failure("a".into(), "HTTP 404")).await;
        assert!(cache.get(&"a".into()).await.is_none());

        cache
            .put_result(&FetchResult::success("b".into(), Bytes::from_static(b"x"), "image/png"))
            .await;
        assert!(cache.get(&"b".into()).await.is_some());
    }

    #[tokio::test]
    async fn test_byte_capacity_is_enforced() {
        let cache = ImageCache::new(config(10, Duration::from_secs(60)));
        for id in ["a", "b", "c"] {
            cache
                .put(id.into(), CacheEntry::new(id.into(), Bytes::from(vec![0u8; 6]), "image/png"))
                .await;
        }

        let (_, valid, weighted) = cache.stats().await;
        assert!(weighted <= 10, "weighted size {} exceeds capacity", weighted);
        assert!(valid <= 1);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = ImageCache::new(config(1024, Duration::from_millis(50)));
        cache
            .put("a".into(), CacheEntry::new("a".into(), Bytes::from_static(b"png"), "image/png"))
            .await;
        assert!(cache.get(&"a".into()).await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get(&"a".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_metadata_cache() {
        let cache = MetadataCache::new(&CacheConfig::default());
        let study = StudyId::from("s");

        let (series_list, hit) = cache
            .get_or_resolve(&study, async { Ok(vec![series("x")]) })
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(series_list.len(), 1);

        let (_, hit) = cache
            .get_or_resolve(&study, async {
                Err(PacsError::Internal("resolved twice".to_string()))
            })
            .await
            .unwrap();
        assert!(hit);

        let err = cache
            .get_or_resolve(&"missing".into(), async {
                Err(PacsError::StudyNotFound("missing".to_string()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, PacsError::StudyNotFound("missing".to_string()));
        assert!(cache.get(&"missing".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let images = ImageCache::new(CacheConfig::default());
        let metadata = MetadataCache::new(&CacheConfig::default());
        images.put_result(&FetchResult::success("a".into(), Bytes::from_static(b"abc"), "image/png")).await;
        metadata
            .get_or_resolve(&"s".into(), async { Ok(vec![series("x")]) })
            .await
            .unwrap();

        let stats = collect_stats(&images, &metadata).await;
        assert_eq!(stats.valid_entries, 1);
        assert_eq!(stats.weighted_bytes, 3);
        assert_eq!(stats.metadata_entries, 1);
        assert_eq!(stats.cache_ttl_hours, 24.0);

        clear_all(&images, &metadata);
        assert!(images.get(&"a".into()).await.is_none());
        assert!(metadata.get(&"s".into()).await.is_none());
    }
}
