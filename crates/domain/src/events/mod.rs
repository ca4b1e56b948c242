//! 实时事件定义

pub mod realtime_event;

pub use realtime_event::{ClientEvent, ServerEvent};
