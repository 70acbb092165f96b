//! PostgreSQL 消息存储
//!
//! 追加写入按月分区的 `messages` 父表，路由由 PostgreSQL 按
//! `created_at` 完成。回执写入 `message_receipts`，同一读者对同一
//! 消息的重复回执幂等。

use crate::db::map_sqlx_err;
use application::{MessageStore, StoreError, StoredMessage};
use async_trait::async_trait;
use domain::{MessageId, RoomId, SenderId};
use sqlx::PgPool;

#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn append(&self, message: &StoredMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, room_id, sender_id, msg_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.id)
        .bind(message.room_id.as_str())
        .bind(message.sender_id.as_str())
        .bind(message.msg_id.as_str())
        .bind(&message.payload)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn mark_read(
        &self,
        room_id: &RoomId,
        reader_id: &SenderId,
        msg_id: &MessageId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO message_receipts (room_id, reader_id, msg_id, read_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (room_id, reader_id, msg_id) DO NOTHING
            "#,
        )
        .bind(room_id.as_str())
        .bind(reader_id.as_str())
        .bind(msg_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}
