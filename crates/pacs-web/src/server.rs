//! Web服务器

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use pacs_fetch::FetchService;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::handlers::{
    api_root, cache_stats, clear_cache, fetch_instances, fetch_study, health, instance_preview, metrics,
    study_metadata, study_preview, study_progress, study_series, CACHE_STATUS_HEADER,
};

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, service: Arc<FetchService>, body_limit: usize) -> Self {
        Self {
            addr,
            app: create_app(service, body_limit),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("无法绑定地址 {}", self.addr))?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Web server failed")?;

        info!("Web server stopped");
        Ok(())
    }
}

/// 构建路由
pub fn create_app(service: Arc<FetchService>, body_limit: usize) -> Router {
    Router::new()
        // 根路径
        .route("/", get(api_root))

        // 健康检查
        .route("/health", get(health))

        // 批量获取
        .route("/fetch-study", post(fetch_study))
        .route("/fetch-instances", post(fetch_instances))

        // 元数据与预览
        .route("/study-series", post(study_series))
        .route("/instances/:id/preview", get(instance_preview))
        .route("/studies/:id/preview", get(study_preview))
        .route("/studies/:id/metadata", get(study_metadata))

        // 运维
        .route("/progress/:study_id", get(study_progress))
        .route("/cache-stats", get(cache_stats))
        .route("/clear-cache", post(clear_cache))
        .route("/metrics", get(metrics))
        .with_state(service)

        // 全局中间件
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any)
                        .expose_headers([CACHE_STATUS_HEADER]),
                )
                .layer(DefaultBodyLimit::max(body_limit)),
        )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("无法监听Ctrl-C信号: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("无法监听SIGTERM信号: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("收到关闭信号，正在停止服务...");
}
