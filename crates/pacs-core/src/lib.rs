//! # PACS Core
//!
//! 影像批量获取服务的核心模块，提供标识符、数据模型、错误定义和通用工具。

pub mod error;
pub mod models;
pub mod utils;

pub use error::{PacsError, Result};
pub use models::*;
