//! Redis 发布端
//!
//! 扇出回退路径的生产实现：把房间事件发布到 `room:<roomId>` 频道。
//! 用多路复用连接管理器，断线由 redis crate 自动重连。

use application::{BroadcastError, PubSubPublisher};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

pub struct RedisPublisher {
    connection: ConnectionManager,
}

impl RedisPublisher {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Redis 发布端已连接");
        Ok(Self { connection })
    }
}

#[async_trait]
impl PubSubPublisher for RedisPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BroadcastError> {
        let mut connection = self.connection.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut connection)
            .await
            .map_err(|err| BroadcastError::FallbackPublish(err.to_string()))?;
        debug!(channel, receivers, "回退事件已发布");
        Ok(())
    }
}
