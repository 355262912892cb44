//! 日志初始化

use pacs_core::{PacsError, Result};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// 解析日志级别过滤器
pub fn parse_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).map_err(|e| PacsError::Config(format!("invalid log level {:?}: {}", level, e)))
}

/// 初始化全局日志订阅器，进程内只能调用一次
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = parse_filter(&config.level)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| PacsError::Config(format!("failed to initialise logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("info").is_ok());
        assert!(parse_filter("pacs_fetch=debug,tower_http=info").is_ok());
        assert!(parse_filter("pacs_fetch=loud").is_err());
    }
}
