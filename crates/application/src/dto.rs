use domain::{Message, MessageId, ReadReceipt, RoomId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

use crate::repository::RoomSummary;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptDto {
    pub user_id: UserId,
    pub read_at: Timestamp,
}

impl From<&ReadReceipt> for ReceiptDto {
    fn from(receipt: &ReadReceipt) -> Self {
        Self {
            user_id: receipt.user_id,
            read_at: receipt.read_at,
        }
    }
}

/// 历史记录中的消息，附带已读回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDto {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: Timestamp,
    pub read_receipts: Vec<ReceiptDto>,
}

impl MessageDto {
    pub fn new(message: &Message, receipts: &[ReadReceipt]) -> Self {
        Self {
            id: message.id,
            room_id: message.room_id,
            user_id: message.user_id,
            content: message.content.as_str().to_owned(),
            created_at: message.created_at,
            read_receipts: receipts
                .iter()
                .filter(|receipt| receipt.message_id == message.id)
                .map(ReceiptDto::from)
                .collect(),
        }
    }
}

/// 分页参数，页码从 1 开始
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    /// 解析为 (limit, offset)；缺省或为 0 的 limit 取默认值，超过上限时截断
    pub fn resolve(&self, default_limit: u32, max_limit: u32) -> (u32, u32) {
        let limit = match self.limit {
            Some(0) | None => default_limit,
            Some(limit) => limit,
        }
        .min(max_limit)
        .max(1);
        let page = self.page.unwrap_or(1).max(1);
        (limit, (page - 1).saturating_mul(limit))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPage {
    /// 按创建时间升序
    pub messages: Vec<MessageDto>,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomPage {
    pub rooms: Vec<RoomSummary>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}
