//! 实时聊天核心领域模型
//!
//! 包含聊天室、消息、已读回执、违规记录等实体，实时事件，以及联系方式检测与升级策略。

pub mod entities;
pub mod errors;
pub mod events;
pub mod services;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use services::*;
pub use value_objects::*;
