//! # PACS Orthanc集成模块
//!
//! 与上游Orthanc服务器通信，包括：
//! - 带认证的HTTP客户端
//! - 单实例预览图获取（超时与重试）
//! - 检查到序列、序列到实例列表的解析

pub mod client;
pub mod error;
pub mod resolver;
pub mod source;
pub mod worker;

pub use client::{OrthancClient, OrthancConfig, UpstreamAuth};
pub use error::UpstreamError;
pub use resolver::StudyResolver;
pub use source::{ImageSource, MetadataSource, Preview, SeriesDescriptor};
pub use worker::{InstanceFetcher, RetryPolicy};
