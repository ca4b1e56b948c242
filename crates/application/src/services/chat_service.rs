use std::sync::Arc;

use config::RealtimeConfig;
use domain::{
    ChatPair, ChatRoom, DomainError, EscalationAction, GlobalMessage, Message, MessageContent,
    MessageId, ReadReceipt, RoomId, ServerEvent, UserId,
};

use crate::{
    clock::Clock,
    dto::{HistoryPage, MessageDto, PageQuery, RoomPage},
    error::ApplicationError,
    hub::{log_failed_deliveries, RealtimeHub},
    moderation::{ModerationOutcome, ModerationService},
    repository::{ChatRoomRepository, GlobalMessageRepository, MessageRepository, UserRepository},
    scheduler::DeletionScheduler,
};

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct MarkReadRequest {
    pub room_id: RoomId,
    pub message_id: MessageId,
    pub reader_id: UserId,
}

pub struct ChatServiceDependencies {
    pub room_repository: Arc<dyn ChatRoomRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub global_repository: Arc<dyn GlobalMessageRepository>,
    pub user_repository: Arc<dyn UserRepository>,
    pub moderation: Arc<ModerationService>,
    pub scheduler: DeletionScheduler,
    pub hub: Arc<RealtimeHub>,
    pub clock: Arc<dyn Clock>,
    pub settings: RealtimeConfig,
}

pub struct ChatService {
    deps: ChatServiceDependencies,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        Self { deps }
    }

    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.deps.hub
    }

    /// 为两位用户打开聊天室：规范化用户对后插入，已存在则返回已有的那一个
    pub async fn open_room(&self, a: UserId, b: UserId) -> Result<ChatRoom, ApplicationError> {
        let pair = ChatPair::new(a, b)?;
        let room = ChatRoom::new(RoomId::generate(), pair, self.deps.clock.now());
        let room = self.deps.room_repository.find_or_create(room).await?;
        tracing::debug!(room_id = %room.id, "chat room opened");
        Ok(room)
    }

    /// 聊天室不存在和调用者不是成员都返回 `RoomNotFound`
    pub async fn ensure_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<ChatRoom, ApplicationError> {
        self.deps
            .room_repository
            .find_for_member(room_id, user_id)
            .await?
            .ok_or_else(|| DomainError::RoomNotFound.into())
    }

    /// 发送私聊消息
    ///
    /// 持久化成功即视为发送成功。之后的审核与延迟删除都是尽力而为，失败只记录日志。
    pub async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<Message, ApplicationError> {
        let room = self.ensure_member(request.room_id, request.sender_id).await?;
        let content = MessageContent::new(request.content)?;

        let message = Message::new(
            MessageId::generate(),
            room.id,
            request.sender_id,
            content,
            self.deps.clock.now(),
        );
        let message = self.deps.message_repository.append(message).await?;

        let event = ServerEvent::NewMessage {
            message: message.clone(),
        };
        let outcomes = self.deps.hub.broadcast_to_room(room.id, event.clone(), None).await;
        log_failed_deliveries(&event, &outcomes);

        self.moderate(&message).await;

        Ok(message)
    }

    async fn moderate(&self, message: &Message) {
        let outcome = self
            .deps
            .moderation
            .review(message.user_id, message.id, message.content.as_str())
            .await;

        match outcome {
            Ok(ModerationOutcome::Clean) => {}
            Ok(ModerationOutcome::Incident { count, action, .. }) => {
                if action == EscalationAction::Warn {
                    let event = ServerEvent::ModerationWarning {
                        incident_count: count,
                    };
                    let outcomes = self.deps.hub.send_to_user(message.user_id, event.clone()).await;
                    log_failed_deliveries(&event, &outcomes);
                }
                if let Err(err) = self.deps.scheduler.schedule(message.id, message.room_id) {
                    tracing::error!(message_id = %message.id, error = %err, "failed to schedule deletion");
                }
            }
            Err(err) => {
                tracing::error!(
                    message_id = %message.id,
                    user_id = %message.user_id,
                    error = %err,
                    "moderation failed, message delivered anyway"
                );
            }
        }
    }

    /// 发送到全局频道，不做联系方式检测
    pub async fn send_global(
        &self,
        sender_id: UserId,
        content: String,
    ) -> Result<GlobalMessage, ApplicationError> {
        let content = MessageContent::new(content)?;
        let user = self
            .deps
            .user_repository
            .find_summary(sender_id)
            .await?
            .ok_or(ApplicationError::Authentication)?;

        let message = GlobalMessage {
            id: MessageId::generate(),
            user,
            content,
            created_at: self.deps.clock.now(),
        };
        let message = self.deps.global_repository.append(message).await?;

        let event = ServerEvent::GlobalMessage {
            message: message.clone(),
        };
        let outcomes = self.deps.hub.broadcast_global(event.clone(), None).await;
        log_failed_deliveries(&event, &outcomes);

        Ok(message)
    }

    pub async fn global_history(&self) -> Result<Vec<GlobalMessage>, ApplicationError> {
        let limit = self.deps.settings.global_history_limit;
        Ok(self.deps.global_repository.latest(limit).await?)
    }

    /// 标记已读并向聊天室转发回执。重复标记返回首次的回执，同样会转发。
    pub async fn mark_read(&self, request: MarkReadRequest) -> Result<ReadReceipt, ApplicationError> {
        let room = self.ensure_member(request.room_id, request.reader_id).await?;
        let message = self
            .deps
            .message_repository
            .find_by_id(request.message_id)
            .await?
            .filter(|message| message.room_id == room.id)
            .ok_or(DomainError::MessageNotFound)?;

        let receipt = self
            .deps
            .message_repository
            .mark_read(message.id, request.reader_id, self.deps.clock.now())
            .await?;

        let event = ServerEvent::ReadReceipt {
            message_id: receipt.message_id,
            room_id: room.id,
            user_id: receipt.user_id,
            read_at: receipt.read_at,
        };
        let outcomes = self.deps.hub.broadcast_to_room(room.id, event.clone(), None).await;
        log_failed_deliveries(&event, &outcomes);

        Ok(receipt)
    }

    /// 聊天室历史：先取最新的一页，再按时间升序返回，已被任一方软删除的消息不出现
    pub async fn history(
        &self,
        room_id: RoomId,
        user_id: UserId,
        query: PageQuery,
    ) -> Result<HistoryPage, ApplicationError> {
        let room = self.ensure_member(room_id, user_id).await?;
        let settings = &self.deps.settings;
        let (limit, offset) =
            query.resolve(settings.history_page_size, settings.history_max_page_size);

        // 多取一条用于判断是否还有更早的消息
        let mut messages = self
            .deps
            .message_repository
            .latest_visible(room.id, limit + 1, offset)
            .await?;
        let has_more = messages.len() > limit as usize;
        if has_more {
            messages.remove(0);
        }

        let ids: Vec<MessageId> = messages.iter().map(|message| message.id).collect();
        let receipts = self.deps.message_repository.receipts_for(&ids).await?;

        Ok(HistoryPage {
            messages: messages
                .iter()
                .map(|message| MessageDto::new(message, &receipts))
                .collect(),
            page: offset / limit + 1,
            limit,
            has_more,
        })
    }

    pub async fn list_rooms(
        &self,
        user_id: UserId,
        query: PageQuery,
    ) -> Result<RoomPage, ApplicationError> {
        let settings = &self.deps.settings;
        let (limit, offset) =
            query.resolve(settings.history_page_size, settings.history_max_page_size);
        let rooms = self
            .deps
            .room_repository
            .list_for_member(user_id, limit, offset)
            .await?;
        let total = self.deps.room_repository.count_for_member(user_id).await?;

        Ok(RoomPage {
            rooms,
            page: offset / limit + 1,
            limit,
            total,
        })
    }
}
