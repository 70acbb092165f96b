//! Redis 订阅端
//!
//! 跨实例扇出的接收侧：模式订阅 `room:*`，把远端实例发布的房间
//! 事件投递给本实例持有的连接。投递走 `deliver_local`，远端来的
//! 事件不再回发 Pub/Sub，避免实例间转发环路。
//!
//! 订阅连接断开后按指数退避重连，成功后退避归零。

use application::{FanoutBroadcaster, RoomEvent};
use domain::RoomId;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 启动订阅循环，返回任务句柄
pub fn spawn_room_event_subscriber(
    url: String,
    channel_prefix: String,
    broadcaster: Arc<FanoutBroadcaster>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match listen_once(&url, &channel_prefix, &broadcaster).await {
                Ok(()) => {
                    warn!("订阅流结束，准备重连");
                    backoff = INITIAL_BACKOFF;
                }
                Err(err) => {
                    error!(error = %err, backoff_secs = backoff.as_secs(), "订阅失败，退避后重连");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    })
}

async fn listen_once(
    url: &str,
    channel_prefix: &str,
    broadcaster: &FanoutBroadcaster,
) -> Result<(), redis::RedisError> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    let pattern = format!("{channel_prefix}*");
    pubsub.psubscribe(&pattern).await?;
    info!(pattern = %pattern, "房间事件订阅已建立");

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let channel = message.get_channel_name().to_string();
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(channel, error = %err, "订阅消息负载读取失败，丢弃");
                continue;
            }
        };
        let Some(room_id) = room_from_channel(&channel, channel_prefix) else {
            warn!(channel, "频道名不含房间ID，丢弃");
            continue;
        };
        let event: RoomEvent = match serde_json::from_str(&payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(channel, error = %err, "房间事件反序列化失败，丢弃");
                continue;
            }
        };
        let delivered = broadcaster.deliver_local(&room_id, &event);
        debug!(room_id = %room_id, delivered, "远端事件已本地投递");
    }
    Ok(())
}

fn room_from_channel(channel: &str, prefix: &str) -> Option<RoomId> {
    let suffix = channel.strip_prefix(prefix)?;
    if suffix.is_empty() {
        return None;
    }
    Some(RoomId::from(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_maps_to_room() {
        assert_eq!(
            room_from_channel("room:r1", "room:"),
            Some(RoomId::from("r1"))
        );
        assert_eq!(room_from_channel("room:", "room:"), None);
        assert_eq!(room_from_channel("other:r1", "room:"), None);
    }
}
