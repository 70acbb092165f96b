//! 扇出广播器
//!
//! 双路径投递：优先本地直投（同进程内注册的连接），本地一个都
//! 没投出去时回退到外部 Pub/Sub 频道，让持有该房间连接的其他
//! 实例做各自的本地扇出。投递对每个观察到的连接至多一次，整个
//! 集群内尽力而为；持久化的可靠性归存储层，不归广播器。

use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use data_encoding::BASE64;
use domain::{Envelope, EnvelopeKind, MessageId, RoomId, SenderId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// 房间事件：广播的JSON负载，本地投递和 Pub/Sub 回退共用同一形状
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub kind: EnvelopeKind,
    pub room_id: RoomId,
    pub sender_id: SenderId,
    pub msg_id: MessageId,
    /// base64 编码的不透明负载
    pub payload: String,
}

impl RoomEvent {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            kind: envelope.kind,
            room_id: envelope.room_id.clone(),
            sender_id: envelope.sender_id.clone(),
            msg_id: envelope.msg_id.clone(),
            payload: BASE64.encode(&envelope.payload),
        }
    }
}

/// 出站帧：发往客户端的JSON结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// 确认帧，msg_id 对应客户端的原始消息
    MsgAck { msg_id: MessageId },
    /// 结构化错误帧；回错误帧而不是关连接
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        msg_id: Option<String>,
        msg: String,
    },
    /// 房间事件帧
    Event {
        #[serde(flatten)]
        event: RoomEvent,
    },
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    /// 回退发布失败：消息对实时投递而言丢失，持久化由存储层负责
    #[error("fallback publish failed: {0}")]
    FallbackPublish(String),
}

/// Pub/Sub 发布端的抽象，生产实现为 Redis
#[async_trait]
pub trait PubSubPublisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BroadcastError>;
}

/// 一次广播的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// 本地投递了 n 个连接
    Local(usize),
    /// 零本地投递，已发布到回退频道
    Fallback,
    /// 明确跳过本地路径，直接发布
    Published,
}

/// 扇出广播器
pub struct FanoutBroadcaster {
    registry: Arc<ConnectionRegistry>,
    publisher: Arc<dyn PubSubPublisher>,
    channel_prefix: String,
}

impl FanoutBroadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        publisher: Arc<dyn PubSubPublisher>,
        channel_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            publisher,
            channel_prefix: channel_prefix.into(),
        }
    }

    /// 房间对应的回退频道名，如 `room:r1`
    pub fn channel_for(&self, room_id: &RoomId) -> String {
        format!("{}{}", self.channel_prefix, room_id)
    }

    /// 广播一个房间事件。
    ///
    /// `prefer_local` 时先尝试本地直投：对快照中的每个连接尝试一次
    /// 投递，失败（发送端已关闭或发送出错）立即把该连接移出房间，
    /// 绝不重试——坏掉的传输对这次发送而言不可恢复。本地零投递
    /// （房间在本实例不存在，或所有尝试都失败）时回退为一次
    /// Pub/Sub 发布。
    pub async fn broadcast(
        &self,
        room_id: &RoomId,
        event: RoomEvent,
        prefer_local: bool,
    ) -> Result<FanoutOutcome, BroadcastError> {
        if prefer_local {
            let delivered = self.deliver_local(room_id, &event);
            if delivered > 0 {
                return Ok(FanoutOutcome::Local(delivered));
            }
            self.publish_fallback(room_id, &event).await?;
            return Ok(FanoutOutcome::Fallback);
        }

        self.publish_fallback(room_id, &event).await?;
        Ok(FanoutOutcome::Published)
    }

    /// 仅本地投递，返回成功投递数。
    ///
    /// 跨实例订阅者用这个入口，远端来的事件不再回发 Pub/Sub，
    /// 避免转发环路。
    pub fn deliver_local(&self, room_id: &RoomId, event: &RoomEvent) -> usize {
        let targets = self.registry.room_senders(room_id);
        if targets.is_empty() {
            return 0;
        }

        let frame = OutboundFrame::Event {
            event: event.clone(),
        };
        let mut delivered = 0;
        for (conn_id, sender) in targets {
            if sender.is_closed() || sender.send(frame.clone()).is_err() {
                warn!(conn_id = %conn_id, room_id = %room_id, "投递失败，把连接移出房间");
                self.registry.unregister(conn_id, room_id);
                continue;
            }
            delivered += 1;
        }
        debug!(room_id = %room_id, delivered, "本地扇出完成");
        delivered
    }

    async fn publish_fallback(
        &self,
        room_id: &RoomId,
        event: &RoomEvent,
    ) -> Result<(), BroadcastError> {
        let channel = self.channel_for(room_id);
        let payload = serde_json::to_string(event)?;
        self.publisher.publish(&channel, &payload).await
    }
}
