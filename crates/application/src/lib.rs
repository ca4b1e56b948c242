//! 应用层实现。
//!
//! 存储边界（仓库 trait）、会话注册表与房间广播中心、审核服务、延迟删除调度器，
//! 以及把它们串起来的聊天用例服务。

pub mod clock;
pub mod dto;
pub mod error;
pub mod hub;
pub mod memory;
pub mod moderation;
pub mod repository;
pub mod scheduler;
pub mod services;
pub mod typing;

pub use clock::{Clock, SystemClock};
pub use dto::{HistoryPage, MessageDto, PageQuery, ReceiptDto, RoomPage};
pub use error::ApplicationError;
pub use hub::{
    log_failed_deliveries, ConnectionId, Departure, DeliveryError, DeliveryOutcome, EventSender,
    HubError, RealtimeHub, Registration,
};
pub use memory::InMemoryStore;
pub use moderation::{ModerationOutcome, ModerationService};
pub use repository::{
    ChatRoomRepository, GlobalMessageRepository, LastMessage, MessageRepository,
    ModerationRepository, RoomSummary, UserRepository,
};
pub use scheduler::DeletionScheduler;
pub use services::{ChatService, ChatServiceDependencies, MarkReadRequest, SendMessageRequest};
pub use typing::TypingRelay;
