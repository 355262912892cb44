//! HTTP处理器

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
};
use pacs_core::{
    BatchResult, CacheStatus, FetchResult, InstanceId, PacsError, Series, StudyId, DEFAULT_CONTENT_TYPE,
};
use pacs_fetch::FetchService;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{error_response, ApiError};

/// 缓存状态响应头
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache-status");

/// 预览图的缓存控制
const PREVIEW_CACHE_CONTROL: &str = "public, max-age=3600";

pub type AppState = Arc<FetchService>;

/// 检查请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyRequest {
    #[serde(default, alias = "study_id")]
    pub study_id: Option<String>,
    /// 批次超时（毫秒），不超过服务配置的上限
    #[serde(default, alias = "timeout_ms")]
    pub timeout_ms: Option<u64>,
}

impl StudyRequest {
    fn study_id(&self) -> Result<StudyId, PacsError> {
        self.study_id
            .as_deref()
            .map(StudyId::from)
            .ok_or_else(|| PacsError::MalformedRequest("studyId is required".to_string()))
    }
}

/// 实例请求，接受 `{"instanceIds": [...]}` 或直接的ID数组
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum InstancesRequest {
    Ids(Vec<String>),
    Object {
        #[serde(default, rename = "instanceIds", alias = "instance_ids")]
        instance_ids: Option<Vec<String>>,
        #[serde(default, rename = "timeoutMs", alias = "timeout_ms")]
        timeout_ms: Option<u64>,
    },
}

impl InstancesRequest {
    fn into_parts(self) -> Result<(Vec<InstanceId>, Option<Duration>), PacsError> {
        match self {
            InstancesRequest::Ids(ids) => Ok((ids.into_iter().map(InstanceId::from).collect(), None)),
            InstancesRequest::Object {
                instance_ids: Some(ids),
                timeout_ms,
            } => Ok((
                ids.into_iter().map(InstanceId::from).collect(),
                timeout_ms.map(Duration::from_millis),
            )),
            InstancesRequest::Object { instance_ids: None, .. } => {
                Err(PacsError::MalformedRequest("instanceIds is required".to_string()))
            }
        }
    }
}

/// 批量获取响应
#[derive(Debug, Serialize)]
pub struct FetchResponse<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_id: Option<&'a StudyId>,
    pub images: &'a [FetchResult],
    pub total_instances: usize,
    pub successful: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub processing_time: f64,
    pub timed_out: bool,
}

impl<'a> FetchResponse<'a> {
    pub fn new(study_id: Option<&'a StudyId>, batch: &'a BatchResult) -> Self {
        Self {
            study_id,
            images: &batch.results,
            total_instances: batch.total_requested,
            successful: batch.success_count,
            failed: batch.failure_count,
            cache_hits: batch.cache_hits,
            processing_time: batch.processing_time_secs,
            timed_out: batch.timed_out,
        }
    }
}

/// 序列列表响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResponse<'a> {
    pub series: &'a [Series],
    pub total_series: usize,
}

/// API根路径处理器
pub async fn api_root() -> impl IntoResponse {
    Json(json!({
        "service": "PACS Fetcher",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "fetch_study": "POST /fetch-study",
            "fetch_instances": "POST /fetch-instances",
            "study_series": "POST /study-series",
            "instance_preview": "GET /instances/:id/preview",
            "study_preview": "GET /studies/:id/preview",
            "study_metadata": "GET /studies/:id/metadata",
            "progress": "GET /progress/:study_id",
            "cache_stats": "GET /cache-stats",
            "clear_cache": "POST /clear-cache",
            "health": "GET /health",
            "metrics": "GET /metrics"
        }
    }))
}

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// 获取整个检查
pub async fn fetch_study(
    State(service): State<AppState>,
    payload: Result<Json<StudyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let study_id = request.study_id()?;
    let timeout = request.timeout_ms.map(Duration::from_millis);
    info!("Received fetch-study request for {}", study_id);

    let fetch = service.fetch_study(study_id, timeout).await?;

    let body = Json(FetchResponse::new(Some(&fetch.study_id), &fetch.batch));
    Ok(([(CACHE_STATUS_HEADER, fetch.cache_status.as_str())], body).into_response())
}

/// 获取一组实例
pub async fn fetch_instances(
    State(service): State<AppState>,
    payload: Result<Json<InstancesRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let (instances, timeout) = request.into_parts()?;
    info!("Received fetch-instances request with {} instances", instances.len());

    let batch = service.fetch_instances(instances, timeout).await?;

    let body = Json(FetchResponse::new(None, &batch));
    Ok(([(CACHE_STATUS_HEADER, batch.cache_status().as_str())], body).into_response())
}

/// 检查的序列列表
pub async fn study_series(
    State(service): State<AppState>,
    payload: Result<Json<StudyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let series = service.study_series(&request.study_id()?).await?;

    let body = Json(SeriesResponse {
        series: series.as_slice(),
        total_series: series.len(),
    });
    Ok(body.into_response())
}

/// 单个实例的预览图
pub async fn instance_preview(
    State(service): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Response, ApiError> {
    let result = service.instance_preview(&InstanceId::from(instance_id)).await?;
    Ok(preview_response(result))
}

/// 检查的代表预览图
pub async fn study_preview(
    State(service): State<AppState>,
    Path(study_id): Path<String>,
) -> Result<Response, ApiError> {
    let result = service.study_preview(&StudyId::from(study_id)).await?;
    Ok(preview_response(result))
}

/// 检查的结构化元数据
pub async fn study_metadata(
    State(service): State<AppState>,
    Path(study_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let metadata = service.study_metadata(&StudyId::from(study_id)).await?;
    Ok(Json(metadata))
}

/// 检查的获取进度
pub async fn study_progress(State(service): State<AppState>, Path(study_id): Path<String>) -> Response {
    match service.progress(&StudyId::from(study_id.as_str())) {
        Some(progress) => {
            let percent = progress.percent();
            match serde_json::to_value(&progress) {
                Ok(mut body) => {
                    body["percent"] = json!(percent);
                    Json(body).into_response()
                }
                Err(err) => ApiError(err.into()).into_response(),
            }
        }
        None => error_response(
            StatusCode::NOT_FOUND,
            "progress_not_found",
            &format!("no progress recorded for study {}", study_id),
        ),
    }
}

/// 缓存统计
pub async fn cache_stats(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.stats().await)
}

/// 清空缓存
pub async fn clear_cache(State(service): State<AppState>) -> impl IntoResponse {
    service.clear_caches();
    Json(json!({ "status": "cache cleared" }))
}

/// Prometheus指标
pub async fn metrics(State(service): State<AppState>) -> Result<Response, ApiError> {
    let text = service.metrics().render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response())
}

fn preview_response(result: FetchResult) -> Response {
    let cache_status = if result.from_cache {
        CacheStatus::Hit
    } else {
        CacheStatus::Miss
    };

    match (result.success, result.payload) {
        (true, Some(payload)) => {
            let content_type = result
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
            (
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, PREVIEW_CACHE_CONTROL.to_string()),
                    (CACHE_STATUS_HEADER, cache_status.as_str().to_string()),
                ],
                payload,
            )
                .into_response()
        }
        _ => {
            let message = result.error.unwrap_or_else(|| "unknown error".to_string());
            warn!(instance = %result.instance_id, "preview unavailable: {}", message);
            if result.upstream_status == Some(404) {
                error_response(
                    StatusCode::NOT_FOUND,
                    "instance_not_found",
                    &format!("instance {} not found", result.instance_id),
                )
            } else {
                error_response(StatusCode::BAD_GATEWAY, "instance_fetch", &message)
            }
        }
    }
}
