use std::sync::Arc;

use application::{
    ChatRoomRepository, GlobalMessageRepository, LastMessage, MessageRepository,
    ModerationRepository, RoomSummary, UserRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ChatPair, ChatRoom, GlobalMessage, IncidentId, Message, MessageContent, MessageId,
    ModerationFlags, ModerationIncident, ReadReceipt, RepositoryError, RoomId, Timestamp, UserId,
    UserSummary,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
        _ => RepositoryError::storage(err.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn require_row(rows_affected: u64) -> Result<(), RepositoryError> {
    if rows_affected == 0 {
        return Err(RepositoryError::NotFound);
    }
    Ok(())
}

#[derive(Debug, FromRow)]
struct RoomRecord {
    id: Uuid,
    user_low_id: Uuid,
    user_high_id: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<RoomRecord> for ChatRoom {
    type Error = RepositoryError;

    fn try_from(value: RoomRecord) -> Result<Self, Self::Error> {
        let pair = ChatPair::new(value.user_low_id.into(), value.user_high_id.into())
            .map_err(|err| invalid_data(err.to_string()))?;
        Ok(ChatRoom::new(value.id.into(), pair, value.created_at))
    }
}

#[derive(Debug, FromRow)]
struct RoomSummaryRecord {
    room_id: Uuid,
    other_user_id: Uuid,
    created_at: DateTime<Utc>,
    last_content: Option<String>,
    last_created_at: Option<DateTime<Utc>>,
    unread_count: i64,
}

impl From<RoomSummaryRecord> for RoomSummary {
    fn from(value: RoomSummaryRecord) -> Self {
        let last_message = match (value.last_content, value.last_created_at) {
            (Some(content), Some(created_at)) => Some(LastMessage {
                content,
                created_at,
            }),
            _ => None,
        };
        RoomSummary {
            room_id: value.room_id.into(),
            other_user_id: value.other_user_id.into(),
            last_message,
            unread_count: value.unread_count.max(0) as u64,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    chat_room_id: Uuid,
    user_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    deleted_for_recipient_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let content =
            MessageContent::new(value.content).map_err(|err| invalid_data(err.to_string()))?;
        Ok(Message {
            id: value.id.into(),
            room_id: value.chat_room_id.into(),
            user_id: value.user_id.into(),
            content,
            created_at: value.created_at,
            deleted_at: value.deleted_at,
            deleted_for_recipient_at: value.deleted_for_recipient_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ReceiptRecord {
    message_id: Uuid,
    user_id: Uuid,
    read_at: DateTime<Utc>,
}

impl From<ReceiptRecord> for ReadReceipt {
    fn from(value: ReceiptRecord) -> Self {
        ReadReceipt {
            message_id: value.message_id.into(),
            user_id: value.user_id.into(),
            read_at: value.read_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct GlobalMessageRecord {
    id: Uuid,
    user_id: Uuid,
    display_name: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<GlobalMessageRecord> for GlobalMessage {
    type Error = RepositoryError;

    fn try_from(value: GlobalMessageRecord) -> Result<Self, Self::Error> {
        let content =
            MessageContent::new(value.content).map_err(|err| invalid_data(err.to_string()))?;
        Ok(GlobalMessage {
            id: value.id.into(),
            user: UserSummary {
                id: value.user_id.into(),
                name: value.display_name,
            },
            content,
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct IncidentRecord {
    id: Uuid,
    user_id: Uuid,
    message_id: Uuid,
    detected_contact: String,
    created_at: DateTime<Utc>,
}

impl From<IncidentRecord> for ModerationIncident {
    fn from(value: IncidentRecord) -> Self {
        ModerationIncident {
            id: IncidentId::from(value.id),
            user_id: value.user_id.into(),
            message_id: value.message_id.into(),
            detected_contact: value.detected_contact,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct FlagsRecord {
    is_flagged: bool,
    is_blocked: bool,
}

#[derive(Debug, FromRow)]
struct UserSummaryRecord {
    id: Uuid,
    display_name: String,
}

const ROOM_COLUMNS: &str = "id, user_low_id, user_high_id, created_at";
const MESSAGE_COLUMNS: &str =
    "id, chat_room_id, user_id, content, created_at, deleted_at, deleted_for_recipient_at";

#[derive(Clone)]
pub struct PgChatRoomRepository {
    pool: PgPool,
}

impl PgChatRoomRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatRoomRepository for PgChatRoomRepository {
    async fn find_or_create(&self, room: ChatRoom) -> Result<ChatRoom, RepositoryError> {
        // 插入和读取分成两条语句，读取时能看到并发事务已提交的行
        sqlx::query(
            r#"
            INSERT INTO chat_rooms (id, user_low_id, user_high_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_low_id, user_high_id) DO NOTHING
            "#,
        )
        .bind(Uuid::from(room.id))
        .bind(Uuid::from(room.pair.low()))
        .bind(Uuid::from(room.pair.high()))
        .bind(room.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE user_low_id = $1 AND user_high_id = $2"
        ))
        .bind(Uuid::from(room.pair.low()))
        .bind(Uuid::from(room.pair.high()))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        ChatRoom::try_from(record)
    }

    async fn find_for_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<ChatRoom>, RepositoryError> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM chat_rooms \
             WHERE id = $1 AND (user_low_id = $2 OR user_high_id = $2)"
        ))
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(ChatRoom::try_from).transpose()
    }

    async fn list_for_member(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RoomSummary>, RepositoryError> {
        let records = sqlx::query_as::<_, RoomSummaryRecord>(
            r#"
            SELECT
                r.id AS room_id,
                CASE WHEN r.user_low_id = $1 THEN r.user_high_id ELSE r.user_low_id END AS other_user_id,
                r.created_at,
                last.content AS last_content,
                last.created_at AS last_created_at,
                (
                    SELECT COUNT(*)
                    FROM messages m
                    WHERE m.chat_room_id = r.id
                      AND m.user_id <> $1
                      AND m.deleted_at IS NULL
                      AND m.deleted_for_recipient_at IS NULL
                      AND NOT EXISTS (
                          SELECT 1 FROM message_read_receipts rr
                          WHERE rr.message_id = m.id AND rr.user_id = $1
                      )
                ) AS unread_count
            FROM chat_rooms r
            LEFT JOIN LATERAL (
                SELECT content, created_at
                FROM messages m
                WHERE m.chat_room_id = r.id
                  AND m.deleted_at IS NULL
                  AND m.deleted_for_recipient_at IS NULL
                ORDER BY m.created_at DESC, m.seq DESC
                LIMIT 1
            ) last ON TRUE
            WHERE r.user_low_id = $1 OR r.user_high_id = $1
            ORDER BY last.created_at DESC NULLS LAST, r.created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(Uuid::from(user_id))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(records.into_iter().map(RoomSummary::from).collect())
    }

    async fn count_for_member(&self, user_id: UserId) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chat_rooms WHERE user_low_id = $1 OR user_high_id = $1",
        )
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(count.max(0) as u64)
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn append(&self, message: Message) -> Result<Message, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "INSERT INTO messages (id, chat_room_id, user_id, content, created_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.room_id))
        .bind(Uuid::from(message.user_id))
        .bind(message.content.as_str())
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Message::try_from(record)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn mark_read(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<ReadReceipt, RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO message_read_receipts (message_id, user_id, read_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id, user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::from(message_id))
        .bind(Uuid::from(user_id))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let record = sqlx::query_as::<_, ReceiptRecord>(
            "SELECT message_id, user_id, read_at FROM message_read_receipts \
             WHERE message_id = $1 AND user_id = $2",
        )
        .bind(Uuid::from(message_id))
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.into())
    }

    async fn hide_from_recipient(
        &self,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE messages SET deleted_for_recipient_at = $2 \
             WHERE id = $1 AND deleted_for_recipient_at IS NULL",
        )
        .bind(Uuid::from(message_id))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn latest_visible(
        &self,
        room_id: RoomId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE chat_room_id = $1 AND deleted_at IS NULL AND deleted_for_recipient_at IS NULL \
             ORDER BY created_at DESC, seq DESC \
             LIMIT $2 OFFSET $3"
        ))
        .bind(Uuid::from(room_id))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut messages = records
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn receipts_for(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<ReadReceipt>, RepositoryError> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = message_ids.iter().copied().map(Uuid::from).collect();
        let records = sqlx::query_as::<_, ReceiptRecord>(
            "SELECT message_id, user_id, read_at FROM message_read_receipts \
             WHERE message_id = ANY($1) ORDER BY read_at",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(records.into_iter().map(ReadReceipt::from).collect())
    }
}

#[derive(Clone)]
pub struct PgGlobalMessageRepository {
    pool: PgPool,
}

impl PgGlobalMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GlobalMessageRepository for PgGlobalMessageRepository {
    async fn append(&self, message: GlobalMessage) -> Result<GlobalMessage, RepositoryError> {
        sqlx::query(
            "INSERT INTO global_messages (id, user_id, content, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.user.id))
        .bind(message.content.as_str())
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(message)
    }

    async fn latest(&self, limit: u32) -> Result<Vec<GlobalMessage>, RepositoryError> {
        let records = sqlx::query_as::<_, GlobalMessageRecord>(
            r#"
            SELECT g.id, g.user_id, u.display_name, g.content, g.created_at
            FROM global_messages g
            JOIN users u ON u.id = g.user_id
            ORDER BY g.created_at DESC, g.seq DESC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut messages = records
            .into_iter()
            .map(GlobalMessage::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}

#[derive(Clone)]
pub struct PgModerationRepository {
    pool: PgPool,
}

impl PgModerationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ModerationRepository for PgModerationRepository {
    async fn record_incident(
        &self,
        incident: ModerationIncident,
    ) -> Result<ModerationIncident, RepositoryError> {
        let record = sqlx::query_as::<_, IncidentRecord>(
            r#"
            INSERT INTO incidents (id, user_id, message_id, detected_contact, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, message_id, detected_contact, created_at
            "#,
        )
        .bind(Uuid::from(incident.id))
        .bind(Uuid::from(incident.user_id))
        .bind(Uuid::from(incident.message_id))
        .bind(&incident.detected_contact)
        .bind(incident.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.into())
    }

    async fn incident_count(&self, user_id: UserId) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM incidents WHERE user_id = $1")
            .bind(Uuid::from(user_id))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(count.max(0) as u64)
    }

    async fn set_flagged(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET is_flagged = TRUE WHERE id = $1")
            .bind(Uuid::from(user_id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        require_row(result.rows_affected())
    }

    async fn set_blocked(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET is_blocked = TRUE WHERE id = $1")
            .bind(Uuid::from(user_id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        require_row(result.rows_affected())
    }

    async fn flags(&self, user_id: UserId) -> Result<ModerationFlags, RepositoryError> {
        let record = sqlx::query_as::<_, FlagsRecord>(
            "SELECT is_flagged, is_blocked FROM users WHERE id = $1",
        )
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(RepositoryError::NotFound)?;

        Ok(ModerationFlags {
            flagged: record.is_flagged,
            blocked: record.is_blocked,
        })
    }
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_summary(&self, user_id: UserId) -> Result<Option<UserSummary>, RepositoryError> {
        let record = sqlx::query_as::<_, UserSummaryRecord>(
            "SELECT id, display_name FROM users WHERE id = $1",
        )
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(|record| UserSummary {
            id: record.id.into(),
            name: record.display_name,
        }))
    }

    async fn touch_last_seen(&self, user_id: UserId, at: Timestamp) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET last_seen = $2 WHERE id = $1")
            .bind(Uuid::from(user_id))
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        require_row(result.rows_affected())
    }
}

/// 所有仓储共享同一个连接池
#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub user_repository: Arc<PgUserRepository>,
    pub room_repository: Arc<PgChatRoomRepository>,
    pub message_repository: Arc<PgMessageRepository>,
    pub global_repository: Arc<PgGlobalMessageRepository>,
    pub moderation_repository: Arc<PgModerationRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            user_repository: Arc::new(PgUserRepository::new(pool.clone())),
            room_repository: Arc::new(PgChatRoomRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            global_repository: Arc::new(PgGlobalMessageRepository::new(pool.clone())),
            moderation_repository: Arc::new(PgModerationRepository::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
