//! 协议分发
//!
//! 按信封类型分发到对应处理器。类型是封闭枚举，match 穷尽，
//! 没有运行期默认分支；未知判别器在解码层就被拒绝。
//!
//! ack 语义是刻意放宽的：对 `message` 信封，ack 在持久化与广播
//! 结果可知之前就发出，表示"已接受"而非"已投递到所有成员"。
//! 持久化和扇出在单独的有序工作队列里执行：同一分发器收到的
//! 消息按入队顺序依次持久化并广播，慢的持久化不会让后来的消息
//! 先扇出。工作任务失败只记日志，不回传给发送者；扇出没有覆盖
//! 到的接收方通过正常的历史拉取重新同步。

use crate::broadcaster::{FanoutBroadcaster, OutboundFrame, RoomEvent};
use crate::clock::Clock;
use crate::registry::ConnectionRegistry;
use crate::store::{MessageStore, PresenceStore, StoredMessage};
use domain::{ConnectionId, Envelope, EnvelopeKind, RoomId};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("connection is no longer attached")]
    ConnectionGone,
    #[error("presence update failed: {0}")]
    Presence(#[from] crate::store::StoreError),
}

/// 持久化队列里的一个待处理消息
struct PersistJob {
    record: StoredMessage,
    event: RoomEvent,
    room_id: RoomId,
}

/// 信封分发器
pub struct EnvelopeDispatcher {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<FanoutBroadcaster>,
    messages: Arc<dyn MessageStore>,
    presence: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
}

impl EnvelopeDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        broadcaster: Arc<FanoutBroadcaster>,
        messages: Arc<dyn MessageStore>,
        presence: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let persist_tx = Self::spawn_persist_worker(Arc::clone(&messages), Arc::clone(&broadcaster));
        Self {
            registry,
            broadcaster,
            messages,
            presence,
            clock,
            persist_tx,
        }
    }

    /// 持久化工作者：单队列顺序消费。先持久化后广播，
    /// 队列保证消息按接收顺序扇出。分发器销毁时队列关闭，任务退出。
    fn spawn_persist_worker(
        messages: Arc<dyn MessageStore>,
        broadcaster: Arc<FanoutBroadcaster>,
    ) -> mpsc::UnboundedSender<PersistJob> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(err) = messages.append(&job.record).await {
                    error!(room_id = %job.room_id, msg_id = %job.record.msg_id, error = %err, "消息持久化失败");
                }
                if let Err(err) = broadcaster.broadcast(&job.room_id, job.event, true).await {
                    error!(room_id = %job.room_id, error = %err, "广播回退失败，消息对实时投递丢失");
                }
            }
            debug!("持久化队列已关闭，工作任务退出");
        });
        tx
    }

    /// 处理一个解码后的信封：先幂等注册连接到目标房间，再按类型分发。
    /// 一个信封恰好产生一次分发。
    pub async fn dispatch(
        &self,
        conn_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        if !self.registry.register(conn_id, &envelope.room_id) {
            return Err(DispatchError::ConnectionGone);
        }
        self.registry.touch(conn_id);

        match envelope.kind {
            EnvelopeKind::Presence => self.handle_presence(conn_id, envelope).await,
            EnvelopeKind::Message => self.handle_message(conn_id, envelope),
            EnvelopeKind::ReadReceipt => self.handle_read_receipt(envelope).await,
        }
    }

    /// presence：记录连接对外声明的身份（断开时反向清理用），
    /// 更新发送者的在线状态，回 ack
    async fn handle_presence(
        &self,
        conn_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        self.registry
            .record_presence(conn_id, &envelope.room_id, &envelope.sender_id);
        self.presence
            .touch(&envelope.room_id, &envelope.sender_id)
            .await?;
        self.send_to(
            conn_id,
            OutboundFrame::MsgAck {
                msg_id: envelope.msg_id,
            },
        );
        Ok(())
    }

    /// message：立即回 ack，然后把持久化+广播压入有序工作队列
    fn handle_message(
        &self,
        conn_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        self.send_to(
            conn_id,
            OutboundFrame::MsgAck {
                msg_id: envelope.msg_id.clone(),
            },
        );

        let job = PersistJob {
            record: StoredMessage::from_envelope(&envelope, self.clock.now()),
            event: RoomEvent::from_envelope(&envelope),
            room_id: envelope.room_id,
        };
        if self.persist_tx.send(job).is_err() {
            error!("持久化队列已关闭，消息被丢弃");
        }
        Ok(())
    }

    /// read_receipt：更新回执状态，再把回执广播到房间
    async fn handle_read_receipt(&self, envelope: Envelope) -> Result<(), DispatchError> {
        if let Err(err) = self
            .messages
            .mark_read(&envelope.room_id, &envelope.sender_id, &envelope.msg_id)
            .await
        {
            warn!(room_id = %envelope.room_id, error = %err, "回执状态更新失败");
        }

        let event = RoomEvent::from_envelope(&envelope);
        if let Err(err) = self
            .broadcaster
            .broadcast(&envelope.room_id, event, true)
            .await
        {
            warn!(room_id = %envelope.room_id, error = %err, "回执广播回退失败");
        }
        Ok(())
    }

    fn send_to(&self, conn_id: ConnectionId, frame: OutboundFrame) {
        match self.registry.sender_of(conn_id) {
            Some(sender) => {
                if sender.send(frame).is_err() {
                    debug!(conn_id = %conn_id, "出站通道已关闭，帧被丢弃");
                }
            }
            None => debug!(conn_id = %conn_id, "连接已注销，帧被丢弃"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::{BroadcastError, PubSubPublisher};
    use crate::clock::SystemClock;
    use crate::store::{MessageStore, MockMessageStore, MockPresenceStore, StoreError};
    use async_trait::async_trait;
    use domain::{MessageId, SenderId};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PubSubPublisher for RecordingPublisher {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), BroadcastError> {
            self.published
                .lock()
                .unwrap()
                .push((channel.to_string(), payload.to_string()));
            Ok(())
        }
    }

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        publisher: Arc<RecordingPublisher>,
    }

    fn dispatcher_with(
        messages: Arc<dyn MessageStore>,
        presence: MockPresenceStore,
    ) -> (EnvelopeDispatcher, Harness) {
        let registry = Arc::new(ConnectionRegistry::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let broadcaster = Arc::new(FanoutBroadcaster::new(
            Arc::clone(&registry),
            publisher.clone() as Arc<dyn PubSubPublisher>,
            "room:",
        ));
        let dispatcher = EnvelopeDispatcher::new(
            Arc::clone(&registry),
            broadcaster,
            messages,
            Arc::new(presence),
            Arc::new(SystemClock),
        );
        (
            dispatcher,
            Harness {
                registry,
                publisher,
            },
        )
    }

    fn dispatcher(
        messages: MockMessageStore,
        presence: MockPresenceStore,
    ) -> (EnvelopeDispatcher, Harness) {
        dispatcher_with(Arc::new(messages), presence)
    }

    fn attach(
        registry: &ConnectionRegistry,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<OutboundFrame>) {
        let conn = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.attach(conn, tx);
        (conn, rx)
    }

    fn envelope(kind: EnvelopeKind, msg_id: &str) -> Envelope {
        Envelope {
            kind,
            room_id: RoomId::from("r1"),
            sender_id: SenderId::new("alice"),
            msg_id: MessageId::new(msg_id),
            payload: b"hello".to_vec(),
        }
    }

    async fn drain_worker() {
        // 让持久化工作任务消费完队列
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
    }

    fn event_msg_id(frame: &OutboundFrame) -> String {
        match frame {
            OutboundFrame::Event { event } => event.msg_id.as_str().to_string(),
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_acks_persists_and_fans_out_exactly_once() {
        let mut messages = MockMessageStore::new();
        messages.expect_append().times(1).returning(|_| Ok(()));
        let (dispatcher, harness) = dispatcher(messages, MockPresenceStore::new());

        let (conn, mut rx) = attach(&harness.registry);
        dispatcher
            .dispatch(conn, envelope(EnvelopeKind::Message, "m-1"))
            .await
            .unwrap();

        // 发送者恰好收到一个对应 msg_id 的 ack，然后收到房间事件的一份拷贝
        let ack = rx.recv().await.unwrap();
        assert_eq!(
            ack,
            OutboundFrame::MsgAck {
                msg_id: MessageId::new("m-1")
            }
        );
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, OutboundFrame::Event { .. }));
        drain_worker().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_persist_does_not_reorder_fanout() {
        // 第一条消息的持久化比第二条慢得多
        struct SlowFirstStore;

        #[async_trait]
        impl MessageStore for SlowFirstStore {
            async fn append(&self, message: &StoredMessage) -> Result<(), StoreError> {
                if message.msg_id.as_str() == "m-1" {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok(())
            }

            async fn mark_read(
                &self,
                _room_id: &RoomId,
                _reader_id: &SenderId,
                _msg_id: &MessageId,
            ) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let (dispatcher, harness) =
            dispatcher_with(Arc::new(SlowFirstStore), MockPresenceStore::new());
        let (conn, _rx) = attach(&harness.registry);
        let (member, mut member_rx) = attach(&harness.registry);
        harness.registry.register(member, &RoomId::from("r1"));

        dispatcher
            .dispatch(conn, envelope(EnvelopeKind::Message, "m-1"))
            .await
            .unwrap();
        dispatcher
            .dispatch(conn, envelope(EnvelopeKind::Message, "m-2"))
            .await
            .unwrap();

        // 同一连接的两条消息按接收顺序扇出
        let first = member_rx.recv().await.unwrap();
        let second = member_rx.recv().await.unwrap();
        assert_eq!(event_msg_id(&first), "m-1");
        assert_eq!(event_msg_id(&second), "m-2");
    }

    #[tokio::test]
    async fn message_envelope_registers_connection_into_room() {
        let mut messages = MockMessageStore::new();
        messages.expect_append().returning(|_| Ok(()));
        let (dispatcher, harness) = dispatcher(messages, MockPresenceStore::new());

        let (conn, _rx) = attach(&harness.registry);
        dispatcher
            .dispatch(conn, envelope(EnvelopeKind::Message, "m-1"))
            .await
            .unwrap();

        assert_eq!(harness.registry.rooms_of(conn), vec![RoomId::from("r1")]);
    }

    #[tokio::test]
    async fn ack_is_emitted_even_when_persistence_fails() {
        let mut messages = MockMessageStore::new();
        messages.expect_append().times(1).returning(|_| {
            Err(StoreError::Unavailable("pg down".to_string()))
        });
        let (dispatcher, harness) = dispatcher(messages, MockPresenceStore::new());

        let (conn, mut rx) = attach(&harness.registry);
        dispatcher
            .dispatch(conn, envelope(EnvelopeKind::Message, "m-2"))
            .await
            .unwrap();

        // 放宽的 ack 语义：存储失败不回传给发送者，广播照常进行
        assert!(matches!(
            rx.recv().await.unwrap(),
            OutboundFrame::MsgAck { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            OutboundFrame::Event { .. }
        ));
    }

    #[tokio::test]
    async fn presence_touches_store_and_acks() {
        let mut presence = MockPresenceStore::new();
        presence
            .expect_touch()
            .times(1)
            .returning(|_, _| Ok(()));
        let (dispatcher, harness) = dispatcher(MockMessageStore::new(), presence);

        let (conn, mut rx) = attach(&harness.registry);
        dispatcher
            .dispatch(conn, envelope(EnvelopeKind::Presence, "m-3"))
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            OutboundFrame::MsgAck {
                msg_id: MessageId::new("m-3")
            }
        );
    }

    #[tokio::test]
    async fn presence_identity_is_recorded_for_teardown() {
        let mut presence = MockPresenceStore::new();
        presence.expect_touch().returning(|_, _| Ok(()));
        let (dispatcher, harness) = dispatcher(MockMessageStore::new(), presence);

        let (conn, _rx) = attach(&harness.registry);
        dispatcher
            .dispatch(conn, envelope(EnvelopeKind::Presence, "m-3"))
            .await
            .unwrap();

        assert_eq!(
            harness.registry.detach(conn),
            vec![(RoomId::from("r1"), SenderId::new("alice"))]
        );
    }

    #[tokio::test]
    async fn read_receipt_marks_and_broadcasts() {
        let mut messages = MockMessageStore::new();
        messages
            .expect_mark_read()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (dispatcher, harness) = dispatcher(messages, MockPresenceStore::new());

        let (conn, mut rx) = attach(&harness.registry);
        let (other, mut other_rx) = attach(&harness.registry);
        harness.registry.register(other, &RoomId::from("r1"));

        dispatcher
            .dispatch(conn, envelope(EnvelopeKind::ReadReceipt, "m-4"))
            .await
            .unwrap();

        // 回执广播到房间，没有 ack
        assert!(matches!(
            rx.try_recv().unwrap(),
            OutboundFrame::Event { .. }
        ));
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            other_rx.try_recv().unwrap(),
            OutboundFrame::Event { .. }
        ));
        let _ = &harness.publisher;
    }

    #[tokio::test]
    async fn dispatch_on_detached_connection_is_rejected() {
        let (dispatcher, _harness) = dispatcher(MockMessageStore::new(), MockPresenceStore::new());
        let result = dispatcher
            .dispatch(
                ConnectionId::generate(),
                envelope(EnvelopeKind::Presence, "m-5"),
            )
            .await;
        assert!(matches!(result, Err(DispatchError::ConnectionGone)));
    }
}
