//! 领域服务定义

pub mod moderation_policy;

pub use moderation_policy::{detect_contact, EscalationAction};
