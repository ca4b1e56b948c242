//! 双人聊天室
//!
//! 聊天室由恰好两个用户组成，用户对按规范顺序（较小 id 在前）保存，
//! 无论由哪一方发起，同一对用户只会对应一个聊天室。

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{RoomId, Timestamp, UserId};

/// 规范化后的用户对
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatPair {
    low: UserId,
    high: UserId,
}

impl ChatPair {
    pub fn new(a: UserId, b: UserId) -> Result<Self, DomainError> {
        if a == b {
            return Err(DomainError::invalid_argument(
                "participants",
                "cannot open a chat room with yourself",
            ));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: RoomId,
    pub pair: ChatPair,
    pub created_at: Timestamp,
}

impl ChatRoom {
    pub fn new(id: RoomId, pair: ChatPair, created_at: Timestamp) -> Self {
        Self {
            id,
            pair,
            created_at,
        }
    }

    pub fn has_member(&self, user_id: UserId) -> bool {
        self.pair.low == user_id || self.pair.high == user_id
    }

    /// 返回对方用户；调用者不是成员时返回 `None`。
    pub fn other_member(&self, user_id: UserId) -> Option<UserId> {
        if self.pair.low == user_id {
            Some(self.pair.high)
        } else if self.pair.high == user_id {
            Some(self.pair.low)
        } else {
            None
        }
    }
}
