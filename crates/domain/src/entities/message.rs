//! 消息实体
//!
//! 消息创建后不可变，唯一允许变化的是两个软删除时间戳以及附加的已读回执。
//! 消息永远不会被物理删除。

use serde::{Deserialize, Serialize};

use crate::entities::user::UserSummary;
use crate::value_objects::{MessageContent, MessageId, RoomId, Timestamp, UserId};

/// 私聊消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: MessageContent,
    pub created_at: Timestamp,
    /// 作者侧删除时间
    pub deleted_at: Option<Timestamp>,
    /// 仅对接收方隐藏的时间（非对称软删除）
    pub deleted_for_recipient_at: Option<Timestamp>,
}

impl Message {
    pub fn new(
        id: MessageId,
        room_id: RoomId,
        user_id: UserId,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            room_id,
            user_id,
            content,
            created_at,
            deleted_at: None,
            deleted_for_recipient_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_hidden_from_recipient(&self) -> bool {
        self.deleted_for_recipient_at.is_some()
    }

    /// 任意一侧被软删除的消息不会出现在历史记录中。
    pub fn is_visible_in_history(&self) -> bool {
        !self.is_deleted() && !self.is_hidden_from_recipient()
    }

    /// 标记为对接收方隐藏。已隐藏时返回 `false`，首次隐藏的时间保持不变。
    pub fn hide_from_recipient(&mut self, at: Timestamp) -> bool {
        if self.deleted_for_recipient_at.is_some() {
            return false;
        }
        self.deleted_for_recipient_at = Some(at);
        true
    }
}

/// 全局频道消息，与私聊消息是两条独立的逻辑流。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMessage {
    pub id: MessageId,
    pub user: UserSummary,
    pub content: MessageContent,
    pub created_at: Timestamp,
}

/// 已读回执：每个 (message, user) 至多一条，首次已读时间为准。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub read_at: Timestamp,
}
