#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use application::{
    ChatService, ChatServiceDependencies, Clock, DeletionScheduler, InMemoryStore,
    ModerationService, RealtimeHub, SystemClock,
};
use config::AppConfig;
use domain::{UserId, UserSummary};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::{net::TcpListener, net::TcpStream, sync::oneshot, time::sleep};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use web_api::{router, AppState, JwtConfig, JwtService};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 测试用删除延迟，避免每个用例等待 5 秒
pub const TEST_DELETION_DELAY_MS: u64 = 300;

pub struct TestServer {
    pub base_http: String,
    pub base_ws: String,
    pub store: Arc<InMemoryStore>,
    pub chat: Arc<ChatService>,
    pub hub: Arc<RealtimeHub>,
    pub jwt: Arc<JwtService>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    scheduler_shutdown: CancellationToken,
}

impl TestServer {
    /// 基于内存存储启动真实路由
    pub async fn start() -> Self {
        let mut settings = AppConfig::default().realtime;
        settings.deletion_delay_ms = TEST_DELETION_DELAY_MS;

        let store = Arc::new(InMemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let hub = Arc::new(RealtimeHub::new(store.clone(), clock.clone()));
        let scheduler_shutdown = CancellationToken::new();
        let (scheduler, _handle) = DeletionScheduler::spawn(
            store.clone(),
            hub.clone(),
            clock.clone(),
            settings.deletion_delay(),
            scheduler_shutdown.clone(),
        );
        let moderation = Arc::new(ModerationService::new(store.clone(), clock.clone()));

        let chat = Arc::new(ChatService::new(ChatServiceDependencies {
            room_repository: store.clone(),
            message_repository: store.clone(),
            global_repository: store.clone(),
            user_repository: store.clone(),
            moderation,
            scheduler,
            hub: hub.clone(),
            clock,
            settings: settings.clone(),
        }));

        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "test-secret-key".to_string(),
            expiration_hours: 24,
        }));

        let state = AppState::new(chat.clone(), hub.clone(), jwt.clone(), settings);
        let app = router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // 等待服务器启动
        sleep(Duration::from_millis(50)).await;

        Self {
            base_http: format!("http://{addr}"),
            base_ws: format!("ws://{addr}"),
            store,
            chat,
            hub,
            jwt,
            shutdown_tx: Some(shutdown_tx),
            scheduler_shutdown,
        }
    }

    /// 创建用户并签发 token
    pub async fn user(&self, name: &str) -> (UserId, String) {
        let id = UserId::generate();
        self.store
            .add_user(UserSummary {
                id,
                name: name.to_string(),
            })
            .await;
        let token = self.jwt.generate_token(id).expect("token");
        (id, token)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_http, path)
    }

    /// 建立 WebSocket 连接并等待注册完成
    pub async fn connect(&self, token: &str) -> WsStream {
        let before = self.hub.connection_count().await;
        let (ws, _) = connect_async(format!("{}/api/ws?token={}", self.base_ws, token))
            .await
            .expect("websocket connect");
        for _ in 0..100 {
            if self.hub.connection_count().await > before {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.scheduler_shutdown.cancel();
    }
}

/// 读取下一个 JSON 事件，超时返回 `None`
pub async fn next_event(ws: &mut WsStream, within: Duration) -> Option<Value> {
    tokio::time::timeout(within, async {
        while let Some(Ok(message)) = ws.next().await {
            if let TungsteniteMessage::Text(text) = message {
                return serde_json::from_str(text.as_str()).ok();
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// 等待指定类型的事件，途中的其他事件被丢弃
pub async fn expect_event(ws: &mut WsStream, event_type: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match next_event(ws, remaining).await {
            Some(event) if event["type"] == event_type => return event,
            Some(_) => continue,
            None => panic!("expected `{event_type}` event"),
        }
    }
}

/// 在给定时间内没有收到指定类型的事件
pub async fn assert_no_event(ws: &mut WsStream, event_type: &str, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match next_event(ws, remaining).await {
            Some(event) if event["type"] == event_type => {
                panic!("unexpected `{event_type}` event: {event}")
            }
            Some(_) => continue,
            None => return,
        }
    }
}

/// 加入聊天室广播组，服务端没有确认事件，稍等片刻让其生效
pub async fn join_room(ws: &mut WsStream, room_id: impl std::fmt::Display) {
    use futures_util::SinkExt;

    let frame = serde_json::json!({"type": "join-room", "room_id": room_id.to_string()});
    ws.send(TungsteniteMessage::text(frame.to_string()))
        .await
        .expect("send join-room");
    sleep(Duration::from_millis(50)).await;
}
