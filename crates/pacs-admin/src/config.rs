//! 配置管理
//!
//! 分层加载，优先级从低到高：内置默认值、TOML配置文件、
//! `PACS_FETCHER__<SECTION>__<KEY>` 环境变量、旧版环境变量（`ORTHANC_TOKEN`、`PORT`）、命令行参数。

use config::{Config, Environment, File};
use pacs_cache::CacheConfig;
use pacs_core::{PacsError, Result};
use pacs_fetch::{OrchestratorConfig, ServiceConfig};
use pacs_orthanc::{OrthancConfig, RetryPolicy, UpstreamAuth};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

/// 环境变量前缀
const ENV_PREFIX: &str = "PACS_FETCHER";
/// 未指定配置文件时尝试加载的文件名（不含扩展名）
const DEFAULT_CONFIG_NAME: &str = "pacs-fetcher";

/// 获取服务完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 上游Orthanc配置
    pub upstream: UpstreamConfig,
    /// 批量获取配置
    pub fetch: FetchConfig,
    /// 缓存配置
    pub cache: CacheSettings,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听主机
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 请求体大小上限
    pub body_limit_bytes: usize,
}

/// 上游Orthanc配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Orthanc根地址
    pub base_url: String,
    /// 预先编码的Basic认证令牌
    pub auth_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bearer_token: Option<String>,
    /// 不发送认证头
    pub anonymous: bool,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// 可重试错误的最大重试次数
    pub max_retries: u32,
    /// 首次重试前的等待时间，之后逐次翻倍
    pub retry_backoff_ms: u64,
    /// 全进程同时发往上游的影像请求上限
    pub max_connections: usize,
}

/// 批量获取配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// 单个批次的并发获取数
    pub max_concurrency: usize,
    /// 批次超时上限
    pub batch_timeout_secs: u64,
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_bytes: u64,
    pub ttl_secs: u64,
    pub metadata_max_entries: u64,
    /// 已结束检查的进度保留时间
    pub progress_retention_secs: u64,
}

/// 日志格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（EnvFilter语法）
    pub level: String,
    /// 日志格式
    pub format: LogFormat,
}

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            body_limit_bytes: 1024 * 1024, // 1MB
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8042".to_string(),
            auth_token: None,
            username: None,
            password: None,
            bearer_token: None,
            anonymous: false,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            max_retries: 2,
            retry_backoff_ms: 200,
            max_connections: 64,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            batch_timeout_secs: 120,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024, // 512MB
            ttl_secs: 24 * 60 * 60,
            metadata_max_entries: 1024,
            progress_retention_secs: 60 * 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl UpstreamConfig {
    /// 按优先级选择认证方式：Basic令牌、用户名密码、Bearer令牌
    pub fn auth(&self) -> UpstreamAuth {
        if self.anonymous {
            return UpstreamAuth::None;
        }

        match (&self.auth_token, &self.username, &self.password, &self.bearer_token) {
            (Some(token), _, _, _) => UpstreamAuth::BasicToken(token.clone()),
            (None, Some(username), Some(password), _) => UpstreamAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            (None, _, _, Some(token)) => UpstreamAuth::Bearer(token.clone()),
            _ => UpstreamAuth::None,
        }
    }

    fn has_credentials(&self) -> bool {
        self.anonymous || !matches!(self.auth(), UpstreamAuth::None)
    }
}

impl FetcherConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn orthanc_config(&self) -> OrthancConfig {
        OrthancConfig {
            base_url: self.upstream.base_url.trim_end_matches('/').to_string(),
            auth: self.upstream.auth(),
            request_timeout: Duration::from_secs(self.upstream.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.upstream.connect_timeout_secs),
            pool_max_idle_per_host: self.upstream.max_connections,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.upstream.max_retries,
            initial_backoff: Duration::from_millis(self.upstream.retry_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_bytes: self.cache.max_bytes,
            ttl: Duration::from_secs(self.cache.ttl_secs),
            metadata_max_entries: self.cache.metadata_max_entries,
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            orchestrator: OrchestratorConfig {
                max_concurrency: self.fetch.max_concurrency,
                batch_timeout: Duration::from_secs(self.fetch.batch_timeout_secs),
            },
            cache: self.cache_config(),
            retry: self.retry_policy(),
            request_timeout: Duration::from_secs(self.upstream.request_timeout_secs),
            max_upstream_connections: self.upstream.max_connections,
            progress_retention: Duration::from_secs(self.cache.progress_retention_secs),
        }
    }
}

/// 配置管理器
#[derive(Debug, Default)]
pub struct ConfigManager {
    /// 配置验证器
    validator: ConfigValidator,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从配置文件、进程环境变量和命令行参数加载配置
    pub fn load(&self, config_path: Option<&str>, overrides: &CliOverrides) -> Result<FetcherConfig> {
        let env: HashMap<String, String> = std::env::vars().collect();
        self.load_from(config_path, env, overrides)
    }

    /// 使用给定的环境变量表加载配置
    pub fn load_from(
        &self,
        config_path: Option<&str>,
        env: HashMap<String, String>,
        overrides: &CliOverrides,
    ) -> Result<FetcherConfig> {
        let file = match config_path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(env.clone())),
            )
            .build()
            .map_err(|e| PacsError::Config(format!("Failed to load configuration: {}", e)))?;

        let mut config: FetcherConfig = settings
            .try_deserialize()
            .map_err(|e| PacsError::Config(format!("Failed to deserialize configuration: {}", e)))?;

        Self::apply_legacy_env(&mut config, &env)?;
        Self::apply_overrides(&mut config, overrides);

        self.validator.validate(&config)?;

        match config_path {
            Some(path) => info!("Configuration loaded successfully from: {}", path),
            None => info!("Configuration loaded successfully"),
        }
        Ok(config)
    }

    /// 兼容旧部署使用的环境变量
    fn apply_legacy_env(config: &mut FetcherConfig, env: &HashMap<String, String>) -> Result<()> {
        if let Some(token) = env.get("ORTHANC_TOKEN").filter(|t| !t.is_empty()) {
            info!("ORTHANC_TOKEN loaded successfully (length: {})", token.len());
            config.upstream.auth_token = Some(token.clone());
        }

        if let Some(port) = env.get("PORT").filter(|p| !p.is_empty()) {
            config.server.port = port
                .parse()
                .map_err(|_| PacsError::Config(format!("PORT is not a valid port number: {:?}", port)))?;
        }

        Ok(())
    }

    fn apply_overrides(config: &mut FetcherConfig, overrides: &CliOverrides) {
        if let Some(host) = &overrides.host {
            config.server.host = host.clone();
        }
        if let Some(port) = overrides.port {
            config.server.port = port;
        }
        if let Some(level) = &overrides.log_level {
            config.logging.level = level.clone();
        }
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: &'static str,
    /// 验证函数
    validator: fn(&FetcherConfig) -> std::result::Result<(), String>,
    /// 错误消息
    error_message: &'static str,
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "server.port",
                validator: |config| {
                    if config.server.port == 0 {
                        Err("Server port cannot be 0".to_string())
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid server port",
            },
            ValidationRule {
                field_path: "upstream.base_url",
                validator: |config| {
                    let url = &config.upstream.base_url;
                    if url.starts_with("http://") || url.starts_with("https://") {
                        Ok(())
                    } else {
                        Err(format!("{:?} is not an http(s) URL", url))
                    }
                },
                error_message: "Invalid upstream base URL",
            },
            ValidationRule {
                field_path: "upstream.credentials",
                validator: |config| {
                    if config.upstream.has_credentials() {
                        Ok(())
                    } else {
                        Err("set ORTHANC_TOKEN, upstream.auth_token, upstream.username/password, \
                             upstream.bearer_token or upstream.anonymous = true"
                            .to_string())
                    }
                },
                error_message: "Missing upstream credentials",
            },
            ValidationRule {
                field_path: "upstream.max_connections",
                validator: |config| {
                    if config.upstream.max_connections == 0 {
                        Err("Upstream max connections cannot be 0".to_string())
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid upstream max connections",
            },
            ValidationRule {
                field_path: "fetch.max_concurrency",
                validator: |config| {
                    if config.fetch.max_concurrency == 0 {
                        Err("Fetch max concurrency cannot be 0".to_string())
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid fetch max concurrency",
            },
            ValidationRule {
                field_path: "cache.max_bytes",
                validator: |config| {
                    if config.cache.max_bytes == 0 {
                        Err("Cache capacity cannot be 0".to_string())
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid cache capacity",
            },
            ValidationRule {
                field_path: "cache.ttl_secs",
                validator: |config| {
                    if config.cache.ttl_secs == 0 {
                        Err("Cache TTL must be at least 1 second".to_string())
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid cache TTL",
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置，报告第一个失败的规则
    pub fn validate(&self, config: &FetcherConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(PacsError::Config(format!("{}: {}", rule.error_message, e)));
            }
        }

        if config.upstream.anonymous {
            warn!("上游Orthanc以匿名方式访问");
        }

        info!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn write_config(name: &str, content: &str) -> String {
        let path = std::env::temp_dir().join(format!("pacs-fetcher-{}-{}.toml", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_defaults_with_legacy_token() {
        let config = ConfigManager::new()
            .load_from(None, env(&[("ORTHANC_TOKEN", "dGVzdDp0ZXN0")]), &CliOverrides::default())
            .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.fetch.max_concurrency, 16);
        assert_eq!(config.cache.ttl_secs, 86400);
        assert_eq!(config.upstream.auth(), UpstreamAuth::BasicToken("dGVzdDp0ZXN0".to_string()));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = ConfigManager::new()
            .load_from(None, HashMap::new(), &CliOverrides::default())
            .unwrap_err();

        match err {
            PacsError::Config(msg) => assert!(msg.contains("credentials")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_layering() {
        let path = write_config(
            "layering",
            r#"
[server]
port = 9000

[upstream]
base_url = "https://pacs.example.org/orthanc/"
username = "file-user"
password = "file-pass"

[fetch]
max_concurrency = 4
"#,
        );

        let vars = env(&[
            ("PACS_FETCHER__FETCH__MAX_CONCURRENCY", "8"),
            ("PACS_FETCHER__CACHE__TTL_SECS", "60"),
            ("PORT", "9100"),
        ]);
        let overrides = CliOverrides {
            port: Some(9200),
            log_level: Some("debug".to_string()),
            ..CliOverrides::default()
        };

        let config = ConfigManager::new().load_from(Some(&path), vars, &overrides).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.fetch.max_concurrency, 8);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.upstream.auth(),
            UpstreamAuth::Basic {
                username: "file-user".to_string(),
                password: "file-pass".to_string()
            }
        );

        let orthanc = config.orthanc_config();
        assert_eq!(orthanc.base_url, "https://pacs.example.org/orthanc");

        let service = config.service_config();
        assert_eq!(service.orchestrator.max_concurrency, 8);
        assert_eq!(service.cache.ttl, Duration::from_secs(60));
        assert_eq!(service.retry.max_retries, 2);
    }

    #[test]
    fn test_legacy_port_must_be_numeric() {
        let err = ConfigManager::new()
            .load_from(
                None,
                env(&[("ORTHANC_TOKEN", "x"), ("PORT", "http")]),
                &CliOverrides::default(),
            )
            .unwrap_err();
        assert!(matches!(err, PacsError::Config(_)));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = ConfigManager::new()
            .load_from(
                Some("/nonexistent/pacs-fetcher.toml"),
                env(&[("ORTHANC_TOKEN", "x")]),
                &CliOverrides::default(),
            )
            .unwrap_err();
        assert!(matches!(err, PacsError::Config(_)));
    }

    #[test]
    fn test_validation_rules() {
        let validator = ConfigValidator::new();
        let mut config = FetcherConfig::default();
        config.upstream.anonymous = true;
        assert!(validator.validate(&config).is_ok());

        let mut bad = config.clone();
        bad.server.port = 0;
        assert!(validator.validate(&bad).is_err());

        let mut bad = config.clone();
        bad.upstream.base_url = "ftp://pacs".to_string();
        assert!(validator.validate(&bad).is_err());

        let mut bad = config.clone();
        bad.fetch.max_concurrency = 0;
        assert!(validator.validate(&bad).is_err());

        let mut bad = config.clone();
        bad.upstream.max_connections = 0;
        assert!(validator.validate(&bad).is_err());

        let mut bad = config.clone();
        bad.cache.ttl_secs = 0;
        assert!(validator.validate(&bad).is_err());

        let mut bad = config;
        bad.cache.max_bytes = 0;
        assert!(validator.validate(&bad).is_err());
    }

    #[test]
    fn test_auth_precedence() {
        let mut upstream = UpstreamConfig {
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            bearer_token: Some("jwt".to_string()),
            ..UpstreamConfig::default()
        };
        assert!(matches!(upstream.auth(), UpstreamAuth::Basic { .. }));

        upstream.password = None;
        assert_eq!(upstream.auth(), UpstreamAuth::Bearer("jwt".to_string()));

        upstream.anonymous = true;
        assert_eq!(upstream.auth(), UpstreamAuth::None);
    }
}
