//! 外部存储的抽象
//!
//! 消息持久化和在线状态都是外部协作者：这里只定义 trait 和
//! 测试/本地运行用的内存实现，生产实现在 infrastructure 层。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{Envelope, MessageId, RoomId, SenderId};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
}

/// 待持久化的消息记录
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: Uuid,
    pub room_id: RoomId,
    pub sender_id: SenderId,
    pub msg_id: MessageId,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_envelope(envelope: &Envelope, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: envelope.room_id.clone(),
            sender_id: envelope.sender_id.clone(),
            msg_id: envelope.msg_id.clone(),
            payload: envelope.payload.clone(),
            created_at,
        }
    }
}

/// 消息存储：追加写入分区表，以及已读回执状态
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: &StoredMessage) -> Result<(), StoreError>;

    async fn mark_read(
        &self,
        room_id: &RoomId,
        reader_id: &SenderId,
        msg_id: &MessageId,
    ) -> Result<(), StoreError>;
}

/// 在线状态存储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 刷新发送者在房间内的在线时间戳
    async fn touch(&self, room_id: &RoomId, sender_id: &SenderId) -> Result<(), StoreError>;

    /// 房间内当前在线的发送者
    async fn online(&self, room_id: &RoomId) -> Result<Vec<SenderId>, StoreError>;

    /// 发送者离开房间
    async fn clear(&self, room_id: &RoomId, sender_id: &SenderId) -> Result<(), StoreError>;
}

/// 内存实现（用于测试和本地运行）
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryMessageStore {
        messages: RwLock<Vec<StoredMessage>>,
        receipts: RwLock<Vec<(RoomId, SenderId, MessageId)>>,
    }

    impl MemoryMessageStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn messages(&self) -> Vec<StoredMessage> {
            self.messages.read().await.clone()
        }

        pub async fn receipts(&self) -> Vec<(RoomId, SenderId, MessageId)> {
            self.receipts.read().await.clone()
        }
    }

    #[async_trait]
    impl MessageStore for MemoryMessageStore {
        async fn append(&self, message: &StoredMessage) -> Result<(), StoreError> {
            self.messages.write().await.push(message.clone());
            Ok(())
        }

        async fn mark_read(
            &self,
            room_id: &RoomId,
            reader_id: &SenderId,
            msg_id: &MessageId,
        ) -> Result<(), StoreError> {
            self.receipts
                .write()
                .await
                .push((room_id.clone(), reader_id.clone(), msg_id.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryPresenceStore {
        rooms: RwLock<HashMap<RoomId, HashSet<SenderId>>>,
    }

    impl MemoryPresenceStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn touch(&self, room_id: &RoomId, sender_id: &SenderId) -> Result<(), StoreError> {
            self.rooms
                .write()
                .await
                .entry(room_id.clone())
                .or_default()
                .insert(sender_id.clone());
            Ok(())
        }

        async fn online(&self, room_id: &RoomId) -> Result<Vec<SenderId>, StoreError> {
            let rooms = self.rooms.read().await;
            Ok(rooms
                .get(room_id)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn clear(&self, room_id: &RoomId, sender_id: &SenderId) -> Result<(), StoreError> {
            let mut rooms = self.rooms.write().await;
            if let Some(members) = rooms.get_mut(room_id) {
                members.remove(sender_id);
                if members.is_empty() {
                    rooms.remove(room_id);
                }
            }
            Ok(())
        }
    }
}
