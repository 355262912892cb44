//! # PACS缓存模块
//!
//! - 按字节数限制、带TTL的影像缓存
//! - 检查元数据（序列列表）缓存
//! - 进行中请求去重表

pub mod cache;
pub mod inflight;

pub use cache::{clear_all, collect_stats, CacheConfig, CacheEntry, CacheStats, ImageCache, MetadataCache};
pub use inflight::{InFlight, InFlightHandle};
