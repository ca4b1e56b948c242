//! 会话注册表与房间广播中心
//!
//! 每个实时连接注册时绑定一个已认证用户，之后可以加入任意数量的聊天室广播组。
//! 在线状态由"每个用户的活跃连接数"推导：从 0 到 1 时广播上线，最后一个连接关闭时广播下线，
//! 多标签页不会重复通知。
//!
//! 投递是尽力而为、至多一次的：每个连接有独立的有界发送队列，投递结果逐个返回，
//! 单个接收方失败不会影响其他接收方。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use domain::{RoomId, ServerEvent, UserId};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::clock::Clock;
use crate::repository::UserRepository;

/// 实时连接标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 连接的出站事件队列
pub type EventSender = mpsc::Sender<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("connection backlog full")]
    Backlogged,
}

/// 单个接收方的投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub connection_id: ConnectionId,
    pub result: Result<(), DeliveryError>,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub connection_id: ConnectionId,
    /// 该用户此前没有任何活跃连接
    pub came_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub user_id: UserId,
    /// 这是该用户最后一个活跃连接
    pub went_offline: bool,
}

struct ConnectionEntry {
    user_id: UserId,
    rooms: HashSet<RoomId>,
    sender: EventSender,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

impl HubState {
    fn deliver<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a ConnectionId>,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Vec<DeliveryOutcome> {
        targets
            .into_iter()
            .filter(|id| Some(**id) != exclude)
            .filter_map(|id| self.connections.get(id).map(|entry| (*id, entry)))
            .map(|(connection_id, entry)| {
                let result = entry.sender.try_send(event.clone()).map_err(|err| match err {
                    mpsc::error::TrySendError::Full(_) => DeliveryError::Backlogged,
                    mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
                });
                DeliveryOutcome {
                    connection_id,
                    result,
                }
            })
            .collect()
    }
}

pub struct RealtimeHub {
    state: RwLock<HubState>,
    users: Arc<dyn UserRepository>,
    clock: Arc<dyn Clock>,
}

impl RealtimeHub {
    pub fn new(users: Arc<dyn UserRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            users,
            clock,
        }
    }

    /// 注册已认证的连接；若是该用户的第一个活跃连接，向其他所有连接广播上线。
    pub async fn register(&self, user_id: UserId, sender: EventSender) -> Registration {
        let connection_id = ConnectionId::generate();
        let mut state = self.state.write().await;

        state.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                rooms: HashSet::new(),
                sender,
            },
        );
        let user_connections = state.users.entry(user_id).or_default();
        user_connections.insert(connection_id);
        let came_online = user_connections.len() == 1;

        if came_online {
            let event = ServerEvent::UserOnline { user_id };
            let outcomes = state.deliver(state.connections.keys(), &event, Some(connection_id));
            log_failed_deliveries(&event, &outcomes);
            tracing::info!(user_id = %user_id, "user is online");
        }

        tracing::debug!(connection_id = %connection_id, user_id = %user_id, "connection registered");
        Registration {
            connection_id,
            came_online,
        }
    }

    /// 注销连接。最后一个连接关闭时广播下线，并异步记录最后在线时间（不阻塞注销）。
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<Departure> {
        let mut state = self.state.write().await;
        let entry = state.connections.remove(&connection_id)?;

        for room_id in &entry.rooms {
            if let Some(members) = state.rooms.get_mut(room_id) {
                members.remove(&connection_id);
                if members.is_empty() {
                    state.rooms.remove(room_id);
                }
            }
        }

        let user_id = entry.user_id;
        let went_offline = match state.users.get_mut(&user_id) {
            Some(connections) => {
                connections.remove(&connection_id);
                connections.is_empty()
            }
            None => true,
        };

        if went_offline {
            state.users.remove(&user_id);
            let event = ServerEvent::UserOffline { user_id };
            let outcomes = state.deliver(state.connections.keys(), &event, None);
            log_failed_deliveries(&event, &outcomes);
            drop(state);

            let users = Arc::clone(&self.users);
            let at = self.clock.now();
            tokio::spawn(async move {
                if let Err(err) = users.touch_last_seen(user_id, at).await {
                    tracing::warn!(user_id = %user_id, error = %err, "failed to record last seen");
                }
            });
            tracing::info!(user_id = %user_id, "user is offline");
        }

        tracing::debug!(connection_id = %connection_id, user_id = %user_id, "connection unregistered");
        Some(Departure {
            user_id,
            went_offline,
        })
    }

    /// 将连接加入聊天室广播组。成员关系只属于这个连接，断线后需要客户端重新加入。
    pub async fn join(&self, connection_id: ConnectionId, room_id: RoomId) -> Result<(), HubError> {
        let mut state = self.state.write().await;
        let entry = state
            .connections
            .get_mut(&connection_id)
            .ok_or(HubError::UnknownConnection(connection_id))?;
        entry.rooms.insert(room_id);
        state.rooms.entry(room_id).or_default().insert(connection_id);
        tracing::debug!(connection_id = %connection_id, room_id = %room_id, "joined room");
        Ok(())
    }

    pub async fn is_joined(&self, connection_id: ConnectionId, room_id: RoomId) -> bool {
        let state = self.state.read().await;
        state
            .connections
            .get(&connection_id)
            .map(|entry| entry.rooms.contains(&room_id))
            .unwrap_or(false)
    }

    /// 投递给聊天室内当前所有连接，可排除一个连接（通常是发送者）。
    pub async fn broadcast_to_room(
        &self,
        room_id: RoomId,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Vec<DeliveryOutcome> {
        let state = self.state.read().await;
        match state.rooms.get(&room_id) {
            Some(members) => state.deliver(members, &event, exclude),
            None => Vec::new(),
        }
    }

    /// 投递给所有活跃连接，不区分聊天室。
    pub async fn broadcast_global(
        &self,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Vec<DeliveryOutcome> {
        let state = self.state.read().await;
        state.deliver(state.connections.keys(), &event, exclude)
    }

    /// 投递给某个用户的所有连接。
    pub async fn send_to_user(&self, user_id: UserId, event: ServerEvent) -> Vec<DeliveryOutcome> {
        let state = self.state.read().await;
        match state.users.get(&user_id) {
            Some(connections) => state.deliver(connections, &event, None),
            None => Vec::new(),
        }
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.state.read().await.users.keys().copied().collect()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.state.read().await.users.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// 停机时清空所有表。发送队列被丢弃后，各连接的写循环随之结束。
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let count = state.connections.len();
        *state = HubState::default();
        tracing::info!(connections = count, "realtime hub cleared");
    }
}

/// 记录投递失败的接收方；失败本身不是错误。
pub fn log_failed_deliveries(event: &ServerEvent, outcomes: &[DeliveryOutcome]) {
    for outcome in outcomes {
        if let Err(err) = outcome.result {
            tracing::debug!(
                event = event.name(),
                connection_id = %outcome.connection_id,
                error = %err,
                "event not delivered"
            );
        }
    }
}
