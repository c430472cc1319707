//! 聊天中继服务入口
//!
//! 读取配置，启动 Axum 中继服务。

use config::AppConfig;
use tracing_subscriber::EnvFilter;
use web_api::{router, RelayState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    let relay = &config.relay;

    let state = RelayState::new(relay);
    let app = router(state);

    let addr = format!("{}:{}", relay.host, relay.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, "聊天中继服务已启动");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("聊天中继服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "无法监听退出信号");
    }
}
