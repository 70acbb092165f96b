use application::{
    ConnectionRegistry, EnvelopeCodec, EnvelopeDispatcher, FanoutBroadcaster, HeartbeatPolicy,
    PresenceStore,
};
use std::sync::Arc;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<FanoutBroadcaster>,
    pub dispatcher: Arc<EnvelopeDispatcher>,
    pub codec: Arc<EnvelopeCodec>,
    pub presence: Arc<dyn PresenceStore>,
    pub heartbeat: HeartbeatPolicy,
}
