//! 内存实现的存储（用于测试和本地开发）
//!
//! 一把 `RwLock` 保护全部表，每个方法在一次加锁内完成，保证与数据库实现相同的单操作原子性。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use domain::{
    ChatPair, ChatRoom, GlobalMessage, Message, MessageId, ModerationFlags, ModerationIncident,
    ReadReceipt, RepositoryError, RoomId, Timestamp, UserId, UserSummary,
};
use tokio::sync::RwLock;

use crate::repository::{
    ChatRoomRepository, GlobalMessageRepository, LastMessage, MessageRepository,
    ModerationRepository, RoomSummary, UserRepository,
};

#[derive(Debug, Clone)]
struct UserRecord {
    summary: UserSummary,
    last_seen: Option<Timestamp>,
    flags: ModerationFlags,
}

#[derive(Default)]
struct StoreState {
    users: HashMap<UserId, UserRecord>,
    rooms: HashMap<RoomId, ChatRoom>,
    pairs: HashMap<ChatPair, RoomId>,
    messages: Vec<Message>,
    receipts: HashMap<(MessageId, UserId), ReadReceipt>,
    global_messages: Vec<GlobalMessage>,
    incidents: Vec<ModerationIncident>,
}

impl StoreState {
    fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    fn user_mut(&mut self, user_id: UserId) -> Result<&mut UserRecord, RepositoryError> {
        self.users.get_mut(&user_id).ok_or(RepositoryError::NotFound)
    }

    fn summarize(&self, room: &ChatRoom, user_id: UserId) -> Option<RoomSummary> {
        let other_user_id = room.other_member(user_id)?;
        let visible = self
            .messages
            .iter()
            .filter(|message| message.room_id == room.id && message.is_visible_in_history());

        let mut last: Option<&Message> = None;
        let mut unread_count = 0;
        for message in visible {
            if last.map_or(true, |current| message.created_at >= current.created_at) {
                last = Some(message);
            }
            if message.user_id != user_id && !self.receipts.contains_key(&(message.id, user_id)) {
                unread_count += 1;
            }
        }

        Some(RoomSummary {
            room_id: room.id,
            other_user_id,
            last_message: last.map(|message| LastMessage {
                content: message.content.as_str().to_owned(),
                created_at: message.created_at,
            }),
            unread_count,
            created_at: room.created_at,
        })
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个用户（用户资料管理不在本系统范围内）
    pub async fn add_user(&self, summary: UserSummary) {
        let mut state = self.state.write().await;
        state.users.insert(
            summary.id,
            UserRecord {
                summary,
                last_seen: None,
                flags: ModerationFlags::default(),
            },
        );
    }

    pub async fn last_seen(&self, user_id: UserId) -> Option<Timestamp> {
        let state = self.state.read().await;
        state.users.get(&user_id).and_then(|user| user.last_seen)
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    pub async fn incidents_for(&self, user_id: UserId) -> Vec<ModerationIncident> {
        let state = self.state.read().await;
        state
            .incidents
            .iter()
            .filter(|incident| incident.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChatRoomRepository for InMemoryStore {
    async fn find_or_create(&self, room: ChatRoom) -> Result<ChatRoom, RepositoryError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.pairs.get(&room.pair).copied() {
            return state
                .rooms
                .get(&existing)
                .cloned()
                .ok_or(RepositoryError::NotFound);
        }
        state.pairs.insert(room.pair, room.id);
        state.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn find_for_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<ChatRoom>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .rooms
            .get(&room_id)
            .filter(|room| room.has_member(user_id))
            .cloned())
    }

    async fn list_for_member(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RoomSummary>, RepositoryError> {
        let state = self.state.read().await;
        let mut summaries: Vec<RoomSummary> = state
            .rooms
            .values()
            .filter_map(|room| state.summarize(room, user_id))
            .collect();

        // 有消息的聊天室按最后消息时间倒序，没有消息的排在最后
        summaries.sort_by(|a, b| {
            let a_key = a.last_message.as_ref().map(|m| m.created_at);
            let b_key = b.last_message.as_ref().map(|m| m.created_at);
            b_key
                .cmp(&a_key)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        Ok(summaries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count_for_member(&self, user_id: UserId) -> Result<u64, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .rooms
            .values()
            .filter(|room| room.has_member(user_id))
            .count() as u64)
    }
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn append(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut state = self.state.write().await;
        if state.messages.iter().any(|existing| existing.id == message.id) {
            return Err(RepositoryError::Conflict);
        }
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.messages.iter().find(|message| message.id == id).cloned())
    }

    async fn mark_read(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<ReadReceipt, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.messages.iter().any(|message| message.id == message_id) {
            return Err(RepositoryError::NotFound);
        }
        let receipt = state
            .receipts
            .entry((message_id, user_id))
            .or_insert_with(|| ReadReceipt {
                message_id,
                user_id,
                read_at: at,
            });
        Ok(receipt.clone())
    }

    async fn hide_from_recipient(
        &self,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        Ok(state
            .message_mut(message_id)
            .map(|message| message.hide_from_recipient(at))
            .unwrap_or(false))
    }

    async fn latest_visible(
        &self,
        room_id: RoomId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let state = self.state.read().await;
        let mut visible: Vec<&Message> = state
            .messages
            .iter()
            .filter(|message| message.room_id == room_id && message.is_visible_in_history())
            .collect();
        // 稳定排序，同一时间戳保持插入顺序
        visible.sort_by_key(|message| message.created_at);

        let mut page: Vec<Message> = visible
            .into_iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn receipts_for(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<ReadReceipt>, RepositoryError> {
        let wanted: HashSet<&MessageId> = message_ids.iter().collect();
        let state = self.state.read().await;
        let mut receipts: Vec<ReadReceipt> = state
            .receipts
            .values()
            .filter(|receipt| wanted.contains(&receipt.message_id))
            .cloned()
            .collect();
        receipts.sort_by_key(|receipt| receipt.read_at);
        Ok(receipts)
    }
}

#[async_trait]
impl GlobalMessageRepository for InMemoryStore {
    async fn append(&self, message: GlobalMessage) -> Result<GlobalMessage, RepositoryError> {
        let mut state = self.state.write().await;
        state.global_messages.push(message.clone());
        Ok(message)
    }

    async fn latest(&self, limit: u32) -> Result<Vec<GlobalMessage>, RepositoryError> {
        let state = self.state.read().await;
        let skip = state.global_messages.len().saturating_sub(limit as usize);
        Ok(state.global_messages[skip..].to_vec())
    }
}

#[async_trait]
impl ModerationRepository for InMemoryStore {
    async fn record_incident(
        &self,
        incident: ModerationIncident,
    ) -> Result<ModerationIncident, RepositoryError> {
        let mut state = self.state.write().await;
        state.incidents.push(incident.clone());
        Ok(incident)
    }

    async fn incident_count(&self, user_id: UserId) -> Result<u64, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .incidents
            .iter()
            .filter(|incident| incident.user_id == user_id)
            .count() as u64)
    }

    async fn set_flagged(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.user_mut(user_id)?.flags.flagged = true;
        Ok(())
    }

    async fn set_blocked(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.user_mut(user_id)?.flags.blocked = true;
        Ok(())
    }

    async fn flags(&self, user_id: UserId) -> Result<ModerationFlags, RepositoryError> {
        let state = self.state.read().await;
        state
            .users
            .get(&user_id)
            .map(|user| user.flags)
            .ok_or(RepositoryError::NotFound)
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn find_summary(&self, user_id: UserId) -> Result<Option<UserSummary>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.users.get(&user_id).map(|user| user.summary.clone()))
    }

    async fn touch_last_seen(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.user_mut(user_id)?.last_seen = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use domain::MessageContent;

    fn user(name: &str) -> UserSummary {
        UserSummary {
            id: UserId::generate(),
            name: name.to_string(),
        }
    }

    async fn room_between(store: &InMemoryStore, a: UserId, b: UserId) -> ChatRoom {
        let pair = ChatPair::new(a, b).unwrap();
        store
            .find_or_create(ChatRoom::new(RoomId::generate(), pair, Utc::now()))
            .await
            .unwrap()
    }

    async fn append(store: &InMemoryStore, message: Message) -> Message {
        MessageRepository::append(store, message).await.unwrap()
    }

    fn message_at(room: RoomId, author: UserId, text: &str, at: Timestamp) -> Message {
        Message::new(
            MessageId::generate(),
            room,
            author,
            MessageContent::new(text).unwrap(),
            at,
        )
    }

    #[tokio::test]
    async fn find_or_create_returns_existing_room_for_reversed_pair() {
        let store = InMemoryStore::new();
        let a = UserId::generate();
        let b = UserId::generate();
        let first = room_between(&store, a, b).await;
        let second = room_between(&store, b, a).await;
        assert_eq!(first.id, second.id);
        assert_eq!(store.room_count().await, 1);
    }

    #[tokio::test]
    async fn mark_read_keeps_first_timestamp() {
        let store = InMemoryStore::new();
        let a = UserId::generate();
        let b = UserId::generate();
        let room = room_between(&store, a, b).await;
        let message = append(&store, message_at(room.id, a, "hi", Utc::now())).await;

        let first_at = Utc::now();
        let first = store.mark_read(message.id, b, first_at).await.unwrap();
        let second = store
            .mark_read(message.id, b, first_at + Duration::seconds(30))
            .await
            .unwrap();

        assert_eq!(first.read_at, first_at);
        assert_eq!(second.read_at, first_at);
        assert_eq!(store.receipts_for(&[message.id]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hide_from_recipient_reports_change_once() {
        let store = InMemoryStore::new();
        let room = RoomId::generate();
        let message = append(
            &store,
            message_at(room, UserId::generate(), "555-123-4567", Utc::now()),
        )
        .await;

        assert!(store.hide_from_recipient(message.id, Utc::now()).await.unwrap());
        assert!(!store.hide_from_recipient(message.id, Utc::now()).await.unwrap());
        assert!(!store
            .hide_from_recipient(MessageId::generate(), Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn latest_visible_pages_from_newest_and_returns_ascending() {
        let store = InMemoryStore::new();
        let room = RoomId::generate();
        let author = UserId::generate();
        let start = Utc::now();
        for i in 0..5 {
            append(
                &store,
                message_at(room, author, &format!("m{i}"), start + Duration::seconds(i)),
            )
            .await;
        }
        let hidden = append(
            &store,
            message_at(room, author, "gone", start + Duration::seconds(10)),
        )
        .await;
        store.hide_from_recipient(hidden.id, Utc::now()).await.unwrap();

        let page = store.latest_visible(room, 2, 0).await.unwrap();
        let texts: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["m3", "m4"]);

        let older = store.latest_visible(room, 2, 2).await.unwrap();
        let texts: Vec<&str> = older.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["m1", "m2"]);
    }

    #[tokio::test]
    async fn room_listing_counts_unread_from_other_side() {
        let store = InMemoryStore::new();
        let a = user("a");
        let b = user("b");
        store.add_user(a.clone()).await;
        store.add_user(b.clone()).await;
        let room = room_between(&store, a.id, b.id).await;
        let now = Utc::now();

        let first = append(&store, message_at(room.id, b.id, "one", now)).await;
        append(&store, message_at(room.id, b.id, "two", now + Duration::seconds(1))).await;
        append(&store, message_at(room.id, a.id, "mine", now + Duration::seconds(2))).await;
        store.mark_read(first.id, a.id, now).await.unwrap();

        let rooms = store.list_for_member(a.id, 20, 0).await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].other_user_id, b.id);
        assert_eq!(rooms[0].unread_count, 1);
        assert_eq!(rooms[0].last_message.as_ref().unwrap().content, "mine");
        assert_eq!(store.count_for_member(a.id).await.unwrap(), 1);
        assert_eq!(store.count_for_member(UserId::generate()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flags_are_set_independently() {
        let store = InMemoryStore::new();
        let a = user("a");
        store.add_user(a.clone()).await;

        store.set_flagged(a.id).await.unwrap();
        let flags = store.flags(a.id).await.unwrap();
        assert!(flags.flagged);
        assert!(!flags.blocked);

        assert_eq!(
            store.set_blocked(UserId::generate()).await,
            Err(RepositoryError::NotFound)
        );
    }
}
