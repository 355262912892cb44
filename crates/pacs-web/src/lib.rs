//! # PACS Web模块
//!
//! 获取服务的HTTP接口：
//! - `/fetch-study`、`/fetch-instances` 批量获取
//! - 预览图、序列列表与元数据透传
//! - 缓存、进度与指标

pub mod error;
pub mod handlers;
pub mod server;

pub use error::ApiError;
pub use server::{create_app, WebServer};
