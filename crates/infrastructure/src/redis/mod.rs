//! Redis 适配器：Pub/Sub 回退通道和在线状态存储

mod presence;
mod publisher;
mod subscriber;

pub use presence::RedisPresenceStore;
pub use publisher::RedisPublisher;
pub use subscriber::spawn_room_event_subscriber;
