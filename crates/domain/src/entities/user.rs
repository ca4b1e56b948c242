use serde::{Deserialize, Serialize};

use crate::value_objects::UserId;

/// 消息展示用的作者信息（资料管理不在本系统范围内）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
}
