//! 主应用程序入口
//!
//! 加载配置、连接数据库，启动 Axum Web API 与删除调度器；
//! 收到 Ctrl-C 后停止接收新连接，取消待执行的删除任务并断开所有 WebSocket。

use std::sync::Arc;

use application::{
    ChatService, ChatServiceDependencies, Clock, DeletionScheduler, ModerationService,
    RealtimeHub, SystemClock,
};
use config::AppConfig;
use infrastructure::Infrastructure;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，未设置 RUST_LOG 时默认 info
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load()?;
    tracing::info!(environment = ?config.environment, "配置加载完成");

    let infrastructure = Infrastructure::connect(&config.database).await?;
    let storage = infrastructure.storage.clone();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hub = Arc::new(RealtimeHub::new(storage.user_repository.clone(), clock.clone()));

    let shutdown = CancellationToken::new();
    let (scheduler, scheduler_handle) = DeletionScheduler::spawn(
        storage.message_repository.clone(),
        hub.clone(),
        clock.clone(),
        config.realtime.deletion_delay(),
        shutdown.clone(),
    );

    let moderation = Arc::new(ModerationService::new(
        storage.moderation_repository.clone(),
        clock.clone(),
    ));

    let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
        room_repository: storage.room_repository.clone(),
        message_repository: storage.message_repository.clone(),
        global_repository: storage.global_repository.clone(),
        user_repository: storage.user_repository.clone(),
        moderation,
        scheduler,
        hub: hub.clone(),
        clock,
        settings: config.realtime.clone(),
    }));

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let state = AppState::new(chat_service, hub.clone(), jwt_service, config.realtime.clone());

    let app = router(state);
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!("服务器启动在 http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let hub = hub.clone();
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                // 未到期的删除任务直接丢弃，WebSocket 发送端关闭后连接随之结束
                shutdown.cancel();
                hub.clear().await;
            }
        })
        .await?;

    if let Err(err) = scheduler_handle.await {
        tracing::warn!(error = %err, "删除调度器异常退出");
    }
    infrastructure.storage.pool.close().await;

    tracing::info!("服务器已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听停机信号");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到停机信号，开始优雅关闭");
}
