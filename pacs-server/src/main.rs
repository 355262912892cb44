//! PACS批量获取服务主程序

use anyhow::Context;
use clap::Parser;
use pacs_admin::{init_logging, CliOverrides, ConfigManager};
use pacs_fetch::FetchService;
use pacs_orthanc::OrthancClient;
use pacs_web::WebServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// 服务命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-server")]
#[command(about = "PACS批量影像获取服务 (Orthanc前置缓存与并发获取)")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 监听主机
    #[arg(long)]
    host: Option<String>,

    /// 监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 日志级别
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let overrides = CliOverrides {
        host: args.host,
        port: args.port,
        log_level: args.log_level,
    };
    let config = ConfigManager::new()
        .load(args.config.as_deref(), &overrides)
        .context("配置加载失败")?;

    // 初始化日志
    init_logging(&config.logging).context("日志初始化失败")?;

    info!("启动PACS获取服务...");
    info!("服务配置:");
    info!("  监听地址: {}", config.bind_address());
    info!("  上游地址: {}", config.upstream.base_url);
    info!("  批次并发数: {}", config.fetch.max_concurrency);
    info!("  上游连接上限: {}", config.upstream.max_connections);
    info!("  缓存容量: {} MB", config.cache.max_bytes / (1024 * 1024));

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("无效的监听地址: {}", config.bind_address()))?;

    let client = OrthancClient::new(config.orthanc_config()).context("无法创建Orthanc客户端")?;
    let service = FetchService::with_orthanc(config.service_config(), client)?;

    let server = WebServer::new(addr, Arc::new(service), config.server.body_limit_bytes);
    if let Err(e) = server.run().await {
        error!("服务器运行失败: {:#}", e);
        return Err(e);
    }

    Ok(())
}
