//! 延迟删除调度器
//!
//! 检测到联系方式的消息在固定延迟后对接收方隐藏，并向聊天室广播撤回事件。
//! 任务只保存在进程内存中，不可取消，进程重启时未触发的任务会丢失。
//! 同一条消息重复登记只会保留一个待执行任务，执行本身也是幂等的。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use domain::{MessageId, RoomId, ServerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::hub::{log_failed_deliveries, RealtimeHub};
use crate::repository::MessageRepository;

#[derive(Debug, Clone, Copy)]
struct DeletionTask {
    message_id: MessageId,
    room_id: RoomId,
}

/// 调度器句柄，可以在多个服务间共享
#[derive(Clone)]
pub struct DeletionScheduler {
    tx: mpsc::UnboundedSender<DeletionTask>,
}

struct Worker {
    messages: Arc<dyn MessageRepository>,
    hub: Arc<RealtimeHub>,
    clock: Arc<dyn Clock>,
    delay: Duration,
}

impl DeletionScheduler {
    /// 启动后台任务。`shutdown` 被取消后，尚未触发的任务全部丢弃。
    pub fn spawn(
        messages: Arc<dyn MessageRepository>,
        hub: Arc<RealtimeHub>,
        clock: Arc<dyn Clock>,
        delay: Duration,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Worker {
            messages,
            hub,
            clock,
            delay,
        });
        let handle = tokio::spawn(run(worker, rx, shutdown));
        (Self { tx }, handle)
    }

    /// 登记一条消息，在延迟之后对接收方隐藏。
    pub fn schedule(&self, message_id: MessageId, room_id: RoomId) -> Result<(), ApplicationError> {
        self.tx
            .send(DeletionTask {
                message_id,
                room_id,
            })
            .map_err(|_| ApplicationError::infrastructure("deletion scheduler is not running"))
    }
}

async fn run(
    worker: Arc<Worker>,
    mut rx: mpsc::UnboundedReceiver<DeletionTask>,
    shutdown: CancellationToken,
) {
    let mut queue: BinaryHeap<Reverse<(Instant, MessageId, RoomId)>> = BinaryHeap::new();
    let mut armed: HashSet<MessageId> = HashSet::new();

    tracing::info!(delay_ms = worker.delay.as_millis() as u64, "deletion scheduler started");

    loop {
        let next = queue.peek().map(|Reverse((due, _, _))| *due);
        // select! 会对被禁用的分支也求值表达式，因此这里不能直接 unwrap
        let wake_at = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = shutdown.cancelled() => break,
            task = rx.recv() => {
                let Some(task) = task else { break };
                if armed.insert(task.message_id) {
                    queue.push(Reverse((Instant::now() + worker.delay, task.message_id, task.room_id)));
                    tracing::debug!(message_id = %task.message_id, "deletion scheduled");
                } else {
                    tracing::debug!(message_id = %task.message_id, "deletion already pending");
                }
            }
            _ = sleep_until(wake_at), if next.is_some() => {
                let now = Instant::now();
                while let Some(Reverse((due, message_id, room_id))) = queue.peek().copied() {
                    if due > now {
                        break;
                    }
                    queue.pop();
                    armed.remove(&message_id);
                    let worker = Arc::clone(&worker);
                    tokio::spawn(async move { worker.redact(message_id, room_id).await });
                }
            }
        }
    }

    if !queue.is_empty() {
        tracing::warn!(pending = queue.len(), "deletion scheduler stopped with pending tasks");
    }
    tracing::info!("deletion scheduler stopped");
}

impl Worker {
    async fn redact(&self, message_id: MessageId, room_id: RoomId) {
        match self
            .messages
            .hide_from_recipient(message_id, self.clock.now())
            .await
        {
            Ok(true) => {
                let event = ServerEvent::MessageRedacted {
                    message_id,
                    room_id,
                };
                let outcomes = self.hub.broadcast_to_room(room_id, event.clone(), None).await;
                log_failed_deliveries(&event, &outcomes);
                tracing::info!(message_id = %message_id, room_id = %room_id, "message hidden from recipient");
            }
            Ok(false) => {
                tracing::debug!(message_id = %message_id, "message already hidden or missing");
            }
            Err(err) => {
                tracing::error!(message_id = %message_id, error = %err, "failed to hide message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::InMemoryStore;
    use domain::{ChatPair, ChatRoom, Message, MessageContent, UserId};
    use tokio::time::timeout;

    use crate::repository::{ChatRoomRepository, MessageRepository};

    const DELAY: Duration = Duration::from_millis(5000);

    struct Fixture {
        store: Arc<InMemoryStore>,
        hub: Arc<RealtimeHub>,
        scheduler: DeletionScheduler,
        shutdown: CancellationToken,
        message: Message,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let hub = Arc::new(RealtimeHub::new(store.clone(), clock.clone()));
        let shutdown = CancellationToken::new();
        let (scheduler, _handle) =
            DeletionScheduler::spawn(store.clone(), hub.clone(), clock, DELAY, shutdown.clone());

        let (a, b) = (UserId::generate(), UserId::generate());
        let room = store
            .find_or_create(ChatRoom::new(
                domain::RoomId::generate(),
                ChatPair::new(a, b).unwrap(),
                chrono::Utc::now(),
            ))
            .await
            .unwrap();
        let message = store
            .append(Message::new(
                MessageId::generate(),
                room.id,
                a,
                MessageContent::new("call 555-123-4567").unwrap(),
                chrono::Utc::now(),
            ))
            .await
            .unwrap();

        Fixture {
            store,
            hub,
            scheduler,
            shutdown,
            message,
        }
    }

    async fn joined_listener(f: &Fixture) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(16);
        let registration = f.hub.register(UserId::generate(), tx).await;
        f.hub
            .join(registration.connection_id, f.message.room_id)
            .await
            .unwrap();
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn hides_after_delay_and_broadcasts() {
        let f = fixture().await;
        let mut rx = joined_listener(&f).await;
        let started = Instant::now();

        f.scheduler.schedule(f.message.id, f.message.room_id).unwrap();

        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("redaction should arrive")
            .unwrap();
        assert!(started.elapsed() >= DELAY);
        assert_eq!(
            event,
            ServerEvent::MessageRedacted {
                message_id: f.message.id,
                room_id: f.message.room_id,
            }
        );

        let stored = f.store.find_by_id(f.message.id).await.unwrap().unwrap();
        assert!(stored.is_hidden_from_recipient());
        assert!(!stored.is_deleted());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_happens_before_the_delay() {
        let f = fixture().await;
        f.scheduler.schedule(f.message.id, f.message.room_id).unwrap();

        tokio::time::sleep(DELAY - Duration::from_millis(100)).await;
        let stored = f.store.find_by_id(f.message.id).await.unwrap().unwrap();
        assert!(!stored.is_hidden_from_recipient());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_schedules_fire_once() {
        let f = fixture().await;
        let mut rx = joined_listener(&f).await;

        f.scheduler.schedule(f.message.id, f.message.room_id).unwrap();
        f.scheduler.schedule(f.message.id, f.message.room_id).unwrap();

        let first = timeout(Duration::from_secs(10), rx.recv()).await;
        assert!(matches!(first, Ok(Some(ServerEvent::MessageRedacted { .. }))));
        let second = timeout(Duration::from_secs(10), rx.recv()).await;
        assert!(second.is_err(), "only one redaction expected");
    }

    #[tokio::test(start_paused = true)]
    async fn already_hidden_message_is_not_rebroadcast() {
        let f = fixture().await;
        let mut rx = joined_listener(&f).await;
        assert!(f
            .store
            .hide_from_recipient(f.message.id, chrono::Utc::now())
            .await
            .unwrap());

        f.scheduler.schedule(f.message.id, f.message.room_id).unwrap();
        let received = timeout(Duration::from_secs(10), rx.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_tasks() {
        let f = fixture().await;
        f.scheduler.schedule(f.message.id, f.message.room_id).unwrap();
        tokio::task::yield_now().await;
        f.shutdown.cancel();

        tokio::time::sleep(DELAY * 2).await;
        let stored = f.store.find_by_id(f.message.id).await.unwrap().unwrap();
        assert!(!stored.is_hidden_from_recipient());
        assert!(f.scheduler.schedule(f.message.id, f.message.room_id).is_err());
    }
}
