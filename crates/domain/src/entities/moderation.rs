use serde::{Deserialize, Serialize};

use crate::value_objects::{IncidentId, MessageId, Timestamp, UserId};

/// 联系方式分享违规记录，只追加、不更新、不删除。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationIncident {
    pub id: IncidentId,
    pub user_id: UserId,
    pub message_id: MessageId,
    pub detected_contact: String,
    pub created_at: Timestamp,
}

/// 用户账号上的两个审核标记，只会被单调置位，清除属于人工操作。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationFlags {
    pub flagged: bool,
    pub blocked: bool,
}
