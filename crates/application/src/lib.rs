//! 应用层实现。
//!
//! 网关的核心用例：信封编解码、连接注册表、扇出广播、
//! 协议分发、心跳策略和分区生命周期，以及对外部适配器
//! （Pub/Sub、持久化存储、在线状态）的抽象。

pub mod broadcaster;
pub mod clock;
pub mod codec;
pub mod handlers;
pub mod heartbeat;
pub mod partition;
pub mod registry;
pub mod schema;
pub mod store;

pub use broadcaster::{
    BroadcastError, FanoutBroadcaster, FanoutOutcome, OutboundFrame, PubSubPublisher, RoomEvent,
};
pub use clock::{Clock, SystemClock};
pub use codec::{DecodeError, EnvelopeCodec};
pub use handlers::EnvelopeDispatcher;
pub use heartbeat::HeartbeatPolicy;
pub use partition::{
    spawn_partition_scheduler, CycleError, CycleReport, PartitionInfo, PartitionMaintenance,
    PartitionStore,
};
pub use registry::ConnectionRegistry;
pub use schema::{SchemaLoader, SchemaManifest};
pub use store::{MessageStore, PresenceStore, StoreError, StoredMessage};
