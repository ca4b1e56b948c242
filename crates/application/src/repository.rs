//! 存储边界
//!
//! 每个方法都是一个独立的原子操作。跨实体的一致性（例如"聊天室存在且调用者是成员"）
//! 由调用方先读后写完成，接受其中很小的竞态窗口。

use async_trait::async_trait;
use domain::{
    ChatRoom, GlobalMessage, Message, MessageId, ModerationFlags, ModerationIncident,
    ReadReceipt, RepositoryError, RoomId, Timestamp, UserId, UserSummary,
};
use serde::Serialize;

/// 聊天室列表中的最后一条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastMessage {
    pub content: String,
    pub created_at: Timestamp,
}

/// 聊天室列表的读模型
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub other_user_id: UserId,
    pub last_message: Option<LastMessage>,
    pub unread_count: u64,
    pub created_at: Timestamp,
}

#[async_trait]
pub trait ChatRoomRepository: Send + Sync {
    /// 按规范化用户对插入，已存在时返回已有的聊天室（并发调用也只会产生一行）。
    async fn find_or_create(&self, room: ChatRoom) -> Result<ChatRoom, RepositoryError>;

    /// 仅当 `user_id` 是成员时返回聊天室
    async fn find_for_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<ChatRoom>, RepositoryError>;

    /// 按最近活跃时间倒序列出用户的聊天室
    async fn list_for_member(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RoomSummary>, RepositoryError>;

    async fn count_for_member(&self, user_id: UserId) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 持久化消息并返回存储后的记录
    async fn append(&self, message: Message) -> Result<Message, RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    /// 插入或忽略：重复标记返回首次的回执
    async fn mark_read(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<ReadReceipt, RepositoryError>;

    /// 对接收方隐藏消息，返回是否真的有行被修改
    async fn hide_from_recipient(
        &self,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<bool, RepositoryError>;

    /// 最近的 `limit` 条可见消息（跳过最新的 `offset` 条），按创建时间升序返回
    async fn latest_visible(
        &self,
        room_id: RoomId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn receipts_for(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<ReadReceipt>, RepositoryError>;
}

#[async_trait]
pub trait GlobalMessageRepository: Send + Sync {
    async fn append(&self, message: GlobalMessage) -> Result<GlobalMessage, RepositoryError>;

    /// 最近的 `limit` 条全局消息，按创建时间升序返回
    async fn latest(&self, limit: u32) -> Result<Vec<GlobalMessage>, RepositoryError>;
}

#[async_trait]
pub trait ModerationRepository: Send + Sync {
    async fn record_incident(
        &self,
        incident: ModerationIncident,
    ) -> Result<ModerationIncident, RepositoryError>;

    async fn incident_count(&self, user_id: UserId) -> Result<u64, RepositoryError>;

    async fn set_flagged(&self, user_id: UserId) -> Result<(), RepositoryError>;

    async fn set_blocked(&self, user_id: UserId) -> Result<(), RepositoryError>;

    async fn flags(&self, user_id: UserId) -> Result<ModerationFlags, RepositoryError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_summary(&self, user_id: UserId) -> Result<Option<UserSummary>, RepositoryError>;

    async fn touch_last_seen(&self, user_id: UserId, at: Timestamp)
        -> Result<(), RepositoryError>;
}
