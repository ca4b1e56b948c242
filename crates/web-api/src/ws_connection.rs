use application::{ApplicationError, ConnectionId, MarkReadRequest};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{ClientEvent, RoomId, ServerEvent, UserId};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::state::AppState;

/// WebSocket 连接
///
/// 连接在握手认证通过之后才会创建，注册到广播中心后：
/// - 发送任务把广播中心投递的事件和本连接的应答写回客户端
/// - 接收任务解析客户端事件并分发
/// - 任一任务结束即视为断开，随后注销连接
pub struct WebSocketConnection {
    state: AppState,
    user_id: UserId,
}

/// WebSocket 写操作命令
///
/// 只发给本连接的应答不经过广播中心
#[derive(Debug)]
enum WsCommand {
    SendEvent(ServerEvent),
    SendPong(Vec<u8>),
}

impl WebSocketConnection {
    pub fn new(state: AppState, user_id: UserId) -> Self {
        Self { state, user_id }
    }

    pub async fn run(self, socket: WebSocket) {
        let (mut sender, mut incoming) = socket.split();

        let (event_tx, mut event_rx) =
            mpsc::channel::<ServerEvent>(self.state.realtime.connection_buffer);
        let registration = self.state.hub.register(self.user_id, event_tx).await;
        let connection_id = registration.connection_id;

        tracing::info!(user_id = %self.user_id, connection_id = %connection_id, "WebSocket 连接已建立");

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：统一处理所有对 WebSocket sender 的写操作
        let mut send_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(WsCommand::SendEvent(event)) => encode(&event),
                        Some(WsCommand::SendPong(data)) => Some(WsMessage::Pong(data.into())),
                        None => break,
                    },
                    event = event_rx.recv() => match event {
                        Some(event) => encode(&event),
                        // 广播中心已清空，服务正在停机
                        None => {
                            let _ = sender.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                };
                let Some(frame) = frame else { continue };
                if sender.send(frame).await.is_err() {
                    tracing::debug!("WebSocket 写入失败");
                    break;
                }
            }
        });

        // 接收任务：处理来自客户端的事件
        let mut recv_task = {
            let state = self.state.clone();
            let user_id = self.user_id;
            tokio::spawn(async move {
                let dispatcher = Dispatcher {
                    state,
                    user_id,
                    connection_id,
                    cmd_tx,
                };
                while let Some(Ok(message)) = incoming.next().await {
                    if dispatcher.handle_incoming(message).await.is_err() {
                        break;
                    }
                }
            })
        };

        // 等待任意一个任务完成（连接断开）
        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        self.state.hub.unregister(connection_id).await;
        tracing::info!(user_id = %self.user_id, connection_id = %connection_id, "WebSocket 连接已断开");
    }
}

fn encode(event: &ServerEvent) -> Option<WsMessage> {
    match serde_json::to_string(event) {
        Ok(json) => Some(WsMessage::Text(json.into())),
        Err(err) => {
            tracing::warn!(event = event.name(), error = %err, "failed to serialize websocket payload");
            None
        }
    }
}

struct Dispatcher {
    state: AppState,
    user_id: UserId,
    connection_id: ConnectionId,
    cmd_tx: mpsc::Sender<WsCommand>,
}

impl Dispatcher {
    /// 返回 `Err` 表示连接应当关闭
    async fn handle_incoming(&self, message: WsMessage) -> Result<(), ()> {
        match message {
            WsMessage::Close(_) => {
                tracing::debug!(connection_id = %self.connection_id, "WebSocket收到关闭消息");
                return Err(());
            }
            WsMessage::Ping(data) => {
                self.send(WsCommand::SendPong(data.to_vec())).await?;
            }
            WsMessage::Pong(_) => {}
            WsMessage::Text(text) => {
                // 格式错误只回复错误事件，不断开连接
                match serde_json::from_str::<ClientEvent>(text.as_str()) {
                    Ok(event) => {
                        if let Err(reply) = self.dispatch(event).await {
                            self.send(WsCommand::SendEvent(reply)).await?;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(connection_id = %self.connection_id, error = %err, "malformed client event");
                        let reply = ServerEvent::error("INVALID_EVENT", err.to_string());
                        self.send(WsCommand::SendEvent(reply)).await?;
                    }
                }
            }
            WsMessage::Binary(_) => {
                let reply = ServerEvent::error("INVALID_EVENT", "binary frames are not supported");
                self.send(WsCommand::SendEvent(reply)).await?;
            }
        }
        Ok(())
    }

    async fn send(&self, command: WsCommand) -> Result<(), ()> {
        self.cmd_tx.send(command).await.map_err(|_| ())
    }

    /// 处理失败时返回发给本连接的错误事件
    async fn dispatch(&self, event: ClientEvent) -> Result<(), ServerEvent> {
        match event {
            ClientEvent::JoinRoom { room_id } => {
                self.state
                    .chat_service
                    .ensure_member(room_id, self.user_id)
                    .await
                    .map_err(error_event)?;
                self.state
                    .hub
                    .join(self.connection_id, room_id)
                    .await
                    .map_err(|err| ServerEvent::error("CONNECTION_CLOSED", err.to_string()))?;
            }
            ClientEvent::TypingStart { room_id, user } => {
                self.require_joined(room_id).await?;
                self.state
                    .typing
                    .start(self.connection_id, self.user_id, room_id, user)
                    .await;
            }
            ClientEvent::TypingStop { room_id } => {
                self.require_joined(room_id).await?;
                self.state
                    .typing
                    .stop(self.connection_id, self.user_id, room_id)
                    .await;
            }
            ClientEvent::MarkRead {
                message_id,
                room_id,
                reader_id,
            } => {
                if reader_id.is_some_and(|reader| reader != self.user_id) {
                    return Err(ServerEvent::error(
                        "INVALID_ARGUMENT",
                        "reader_id does not match the authenticated user",
                    ));
                }
                self.require_joined(room_id).await?;
                self.state
                    .chat_service
                    .mark_read(MarkReadRequest {
                        room_id,
                        message_id,
                        reader_id: self.user_id,
                    })
                    .await
                    .map_err(error_event)?;
            }
        }
        Ok(())
    }

    async fn require_joined(&self, room_id: RoomId) -> Result<(), ServerEvent> {
        if self.state.hub.is_joined(self.connection_id, room_id).await {
            Ok(())
        } else {
            Err(ServerEvent::error("NOT_JOINED", "join the room first"))
        }
    }
}

fn error_event(error: ApplicationError) -> ServerEvent {
    let error = ApiError::from(error);
    ServerEvent::error(error.code(), error.message())
}
