//! 基础设施层实现。
//!
//! 应用层抽象的生产适配器：Redis（Pub/Sub 回退、在线状态）和
//! PostgreSQL（消息持久化、分区管理面）。

pub mod db;
pub mod redis;

pub use db::{create_pg_pool, PgMessageStore, PgPartitionStore};
pub use redis::{spawn_room_event_subscriber, RedisPresenceStore, RedisPublisher};
