//! 实时通道事件
//!
//! 线上格式为 `{"type": "<kebab-case 名称>", ...字段}` 的 JSON 对象。

use serde::{Deserialize, Serialize};

use crate::entities::{GlobalMessage, Message};
use crate::value_objects::{MessageId, RoomId, Timestamp, UserId};

/// 客户端发往服务器的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// 加入聊天室的广播组
    JoinRoom { room_id: RoomId },
    /// 开始输入，`user` 为客户端提供的展示信息，原样转发
    TypingStart {
        room_id: RoomId,
        #[serde(default)]
        user: serde_json::Value,
    },
    TypingStop { room_id: RoomId },
    /// 标记已读；`reader_id` 若提供必须与当前连接的用户一致
    MarkRead {
        message_id: MessageId,
        room_id: RoomId,
        #[serde(default)]
        reader_id: Option<UserId>,
    },
}

/// 服务器推送给客户端的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    NewMessage {
        message: Message,
    },
    GlobalMessage {
        message: GlobalMessage,
    },
    MessageRedacted {
        message_id: MessageId,
        room_id: RoomId,
    },
    ReadReceipt {
        message_id: MessageId,
        room_id: RoomId,
        user_id: UserId,
        read_at: Timestamp,
    },
    UserTyping {
        room_id: RoomId,
        user_id: UserId,
        user: serde_json::Value,
    },
    UserStoppedTyping {
        room_id: RoomId,
        user_id: UserId,
    },
    ModerationWarning {
        incident_count: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// 事件在线上的名称，用于日志
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserOnline { .. } => "user-online",
            Self::UserOffline { .. } => "user-offline",
            Self::NewMessage { .. } => "new-message",
            Self::GlobalMessage { .. } => "global-message",
            Self::MessageRedacted { .. } => "message-redacted",
            Self::ReadReceipt { .. } => "read-receipt",
            Self::UserTyping { .. } => "user-typing",
            Self::UserStoppedTyping { .. } => "user-stopped-typing",
            Self::ModerationWarning { .. } => "moderation-warning",
            Self::Error { .. } => "error",
        }
    }
}
