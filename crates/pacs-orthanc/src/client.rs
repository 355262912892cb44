//! Orthanc HTTP客户端

use async_trait::async_trait;
use pacs_core::{InstanceId, StudyId, DEFAULT_CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::UpstreamError;
use crate::source::{ImageSource, MetadataSource, Preview, SeriesDescriptor};

/// 上游认证配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamAuth {
    None,
    /// 已编码的Basic凭据（`Authorization: Basic <token>`）
    BasicToken(String),
    Basic { username: String, password: String },
    Bearer(String),
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct OrthancConfig {
    /// Orthanc根地址，例如 `https://pacs.example.org/orthanc`
    pub base_url: String,
    pub auth: UpstreamAuth,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for OrthancConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8042".to_string(),
            auth: UpstreamAuth::None,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 100,
        }
    }
}

/// Orthanc客户端
///
/// 内部的 `reqwest::Client` 维护连接池，克隆开销很小。
#[derive(Debug, Clone)]
pub struct OrthancClient {
    base_url: String,
    auth: UpstreamAuth,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OrthancSeries {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    main_dicom_tags: OrthancSeriesTags,
    instances: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OrthancSeriesTags {
    modality: Option<String>,
    series_description: Option<String>,
    series_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrthancResource {
    #[serde(rename = "ID")]
    id: String,
}

impl OrthancClient {
    pub fn new(config: OrthancConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth: config.auth,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        Self::add_auth_headers(self.http.get(url), &self.auth)
    }

    /// 添加认证头
    fn add_auth_headers(request: reqwest::RequestBuilder, auth: &UpstreamAuth) -> reqwest::RequestBuilder {
        match auth {
            UpstreamAuth::None => request,
            UpstreamAuth::BasicToken(token) => {
                request.header(reqwest::header::AUTHORIZATION, format!("Basic {}", token))
            }
            UpstreamAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            UpstreamAuth::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// 发送GET请求，非2xx响应转换为错误
    async fn send(&self, path: &str) -> Result<reqwest::Response, UpstreamError> {
        debug!("GET {}{}", self.base_url, path);

        let response = self.get(path).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status { status: status.as_u16() });
        }

        Ok(response)
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, UpstreamError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let body = self.send(path).await?.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| UpstreamError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ImageSource for OrthancClient {
    async fn fetch_preview(&self, instance: &InstanceId) -> Result<Preview, UpstreamError> {
        let response = self.send(&format!("/instances/{}/preview", instance)).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let payload = response.bytes().await?;

        Ok(Preview { payload, content_type })
    }
}

#[async_trait]
impl MetadataSource for OrthancClient {
    async fn study_series(&self, study: &StudyId) -> Result<Vec<SeriesDescriptor>, UpstreamError> {
        let series: Vec<OrthancSeries> = self.get_json(&format!("/studies/{}/series", study)).await?;

        Ok(series
            .into_iter()
            .map(|s| SeriesDescriptor {
                id: s.id,
                modality: s.main_dicom_tags.modality,
                description: s.main_dicom_tags.series_description,
                series_number: s.main_dicom_tags.series_number,
                instances: s
                    .instances
                    .map(|ids| ids.into_iter().map(InstanceId::from).collect()),
            })
            .collect())
    }

    async fn series_instances(&self, series_id: &str) -> Result<Vec<InstanceId>, UpstreamError> {
        let instances: Vec<OrthancResource> =
            self.get_json(&format!("/series/{}/instances", series_id)).await?;

        Ok(instances.into_iter().map(|i| InstanceId::from(i.id)).collect())
    }

    async fn study_dicom_json(&self, study: &StudyId) -> Result<Value, UpstreamError> {
        self.get_json(&format!("/studies/{}/ohif-dicom-json", study)).await
    }
}
