//! 输入状态转发
//!
//! 纯转发，不记录"谁正在输入"。中途加入聊天室的连接只会看到之后的开始/停止事件。
//! 去抖由客户端负责。

use std::sync::Arc;

use domain::{RoomId, ServerEvent, UserId};

use crate::hub::{log_failed_deliveries, ConnectionId, RealtimeHub};

pub struct TypingRelay {
    hub: Arc<RealtimeHub>,
}

impl TypingRelay {
    pub fn new(hub: Arc<RealtimeHub>) -> Self {
        Self { hub }
    }

    /// 向聊天室其他连接转发 `user-typing`，`user` 是客户端提供的展示信息
    pub async fn start(
        &self,
        source: ConnectionId,
        user_id: UserId,
        room_id: RoomId,
        user: serde_json::Value,
    ) {
        let event = ServerEvent::UserTyping {
            room_id,
            user_id,
            user,
        };
        let outcomes = self
            .hub
            .broadcast_to_room(room_id, event.clone(), Some(source))
            .await;
        log_failed_deliveries(&event, &outcomes);
    }

    pub async fn stop(&self, source: ConnectionId, user_id: UserId, room_id: RoomId) {
        let event = ServerEvent::UserStoppedTyping { room_id, user_id };
        let outcomes = self
            .hub
            .broadcast_to_room(room_id, event.clone(), Some(source))
            .await;
        log_failed_deliveries(&event, &outcomes);
    }
}
