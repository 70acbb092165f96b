//! Redis 在线状态存储
//!
//! 每个房间一个集合键 `presence:<roomId>`，touch 时写入成员并刷新
//! 键的过期时间。键过期即全房间离线，不需要逐成员的过期簿记。

use application::{PresenceStore, StoreError};
use async_trait::async_trait;
use domain::{RoomId, SenderId};
use redis::aio::ConnectionManager;

const PRESENCE_KEY_PREFIX: &str = "presence:";
const PRESENCE_TTL_SECS: u64 = 120;

pub struct RedisPresenceStore {
    connection: ConnectionManager,
}

impl RedisPresenceStore {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }

    fn key(room_id: &RoomId) -> String {
        format!("{PRESENCE_KEY_PREFIX}{room_id}")
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn touch(&self, room_id: &RoomId, sender_id: &SenderId) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::pipe()
            .sadd(Self::key(room_id), sender_id.as_str())
            .expire(Self::key(room_id), PRESENCE_TTL_SECS as i64)
            .query_async::<()>(&mut connection)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    async fn online(&self, room_id: &RoomId) -> Result<Vec<SenderId>, StoreError> {
        let mut connection = self.connection.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::key(room_id))
            .query_async(&mut connection)
            .await
            .map_err(|err| StoreError::Query(err.to_string()))?;
        Ok(members.into_iter().map(SenderId::new).collect())
    }

    async fn clear(&self, room_id: &RoomId, sender_id: &SenderId) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("SREM")
            .arg(Self::key(room_id))
            .arg(sender_id.as_str())
            .query_async::<()>(&mut connection)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::PresenceStore;

    #[test]
    fn presence_keys_are_room_scoped() {
        assert_eq!(
            RedisPresenceStore::key(&RoomId::from("r1")),
            "presence:r1"
        );
    }

    // 需要本地 Redis 实例
    #[tokio::test]
    async fn touch_then_online_round_trip() {
        if std::env::var("REDIS_INTEGRATION_TEST").is_err() {
            return;
        }
        let store = RedisPresenceStore::connect("redis://localhost:6379")
            .await
            .unwrap();
        let room = RoomId::from("presence-test");
        let sender = SenderId::new("alice");

        store.touch(&room, &sender).await.unwrap();
        let online = store.online(&room).await.unwrap();
        assert!(online.contains(&sender));

        store.clear(&room, &sender).await.unwrap();
        let online = store.online(&room).await.unwrap();
        assert!(!online.contains(&sender));
    }
}
