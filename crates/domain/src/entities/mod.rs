//! 领域实体定义

pub mod chatroom;
pub mod message;
pub mod moderation;
pub mod user;

pub use chatroom::{ChatPair, ChatRoom};
pub use message::{GlobalMessage, Message, ReadReceipt};
pub use moderation::{ModerationFlags, ModerationIncident};
pub use user::UserSummary;
