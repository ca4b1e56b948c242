//! 审核服务：对已持久化的私聊消息执行检测、记录与升级。

use std::sync::Arc;

use domain::{
    detect_contact, EscalationAction, IncidentId, MessageId, ModerationIncident, UserId,
};

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::repository::ModerationRepository;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationOutcome {
    Clean,
    Incident {
        incident: ModerationIncident,
        /// 记录本次违规之后的累计次数
        count: u64,
        action: EscalationAction,
    },
}

impl ModerationOutcome {
    pub fn is_incident(&self) -> bool {
        matches!(self, Self::Incident { .. })
    }
}

pub struct ModerationService {
    repository: Arc<dyn ModerationRepository>,
    clock: Arc<dyn Clock>,
}

impl ModerationService {
    pub fn new(repository: Arc<dyn ModerationRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    /// 检测消息内容。命中时先写入违规记录，再按累计次数升级账号标记。
    ///
    /// 计数在写入之后读取，所以第 N 次违规看到的计数就是 N。
    pub async fn review(
        &self,
        user_id: UserId,
        message_id: MessageId,
        content: &str,
    ) -> Result<ModerationOutcome, ApplicationError> {
        let Some(contact) = detect_contact(content) else {
            return Ok(ModerationOutcome::Clean);
        };

        let incident = self
            .repository
            .record_incident(ModerationIncident {
                id: IncidentId::generate(),
                user_id,
                message_id,
                detected_contact: contact.to_string(),
                created_at: self.clock.now(),
            })
            .await?;
        let count = self.repository.incident_count(user_id).await?;
        let action = EscalationAction::for_count(count);

        match action {
            EscalationAction::None => {
                tracing::info!(user_id = %user_id, message_id = %message_id, count, "contact sharing recorded");
            }
            EscalationAction::Warn => {
                tracing::warn!(user_id = %user_id, count, "contact sharing warning issued");
            }
            EscalationAction::Flag => {
                self.repository.set_flagged(user_id).await?;
                tracing::warn!(user_id = %user_id, count, "account flagged for contact sharing");
            }
            EscalationAction::Block => {
                self.repository.set_blocked(user_id).await?;
                tracing::warn!(user_id = %user_id, count, "account blocked for contact sharing");
            }
        }

        Ok(ModerationOutcome::Incident {
            incident,
            count,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::InMemoryStore;
    use domain::UserSummary;

    async fn setup() -> (ModerationService, Arc<InMemoryStore>, UserId) {
        let store = Arc::new(InMemoryStore::new());
        let user = UserId::generate();
        store
            .add_user(UserSummary {
                id: user,
                name: "sam".into(),
            })
            .await;
        let service = ModerationService::new(store.clone(), Arc::new(SystemClock));
        (service, store, user)
    }

    #[tokio::test]
    async fn clean_content_records_nothing() {
        let (service, store, user) = setup().await;
        let outcome = service
            .review(user, MessageId::generate(), "see you at 7pm")
            .await
            .unwrap();
        assert_eq!(outcome, ModerationOutcome::Clean);
        assert!(store.incidents_for(user).await.is_empty());
    }

    #[tokio::test]
    async fn escalates_on_exact_counts() {
        let (service, store, user) = setup().await;
        let mut actions = Vec::new();
        for _ in 0..7 {
            let outcome = service
                .review(user, MessageId::generate(), "text me 555-123-4567")
                .await
                .unwrap();
            match outcome {
                ModerationOutcome::Incident { action, .. } => actions.push(action),
                ModerationOutcome::Clean => panic!("expected an incident"),
            }
        }

        use EscalationAction::*;
        assert_eq!(actions, vec![None, None, None, Warn, Flag, Block, Block]);
        let flags = store.flags(user).await.unwrap();
        assert!(flags.flagged);
        assert!(flags.blocked);
        assert_eq!(store.incidents_for(user).await.len(), 7);
    }

    #[tokio::test]
    async fn incident_keeps_the_matched_substring() {
        let (service, _, user) = setup().await;
        let message_id = MessageId::generate();
        let outcome = service
            .review(user, message_id, "my number is (555) 123-4567 ok")
            .await
            .unwrap();
        let ModerationOutcome::Incident {
            incident, count, ..
        } = outcome
        else {
            panic!("expected an incident");
        };
        assert_eq!(count, 1);
        assert_eq!(incident.message_id, message_id);
        assert_eq!(incident.detected_contact, "(555) 123-4567");
    }

    #[tokio::test]
    async fn flag_failure_surfaces_as_error() {
        // 用户不存在时置位标记失败
        let store = Arc::new(InMemoryStore::new());
        let service = ModerationService::new(store.clone(), Arc::new(SystemClock));
        let ghost = UserId::generate();
        for _ in 0..4 {
            service
                .review(ghost, MessageId::generate(), "555 123 4567")
                .await
                .unwrap();
        }
        let result = service
            .review(ghost, MessageId::generate(), "555 123 4567")
            .await;
        assert!(matches!(result, Err(ApplicationError::Repository(_))));
    }
}
