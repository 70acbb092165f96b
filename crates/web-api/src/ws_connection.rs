//! WebSocket 连接生命周期
//!
//! 封装单个网关连接：入站信封的解码与分发、出站帧的统一写出、
//! 随机抖动的心跳探测和断开清理。对 WebSocket sender 的所有写
//! 操作经由命令通道串行化，出站帧通道则由注册表持有的发送端
//! 喂入。

use crate::state::AppState;
use application::{DecodeError, OutboundFrame, PresenceStore};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPing(Vec<u8>),
    SendPong(Vec<u8>),
    Close,
}

pub struct GatewayConnection {
    socket: WebSocket,
    state: AppState,
    conn_id: ConnectionId,
}

impl GatewayConnection {
    pub fn new(socket: WebSocket, state: AppState) -> Self {
        Self {
            socket,
            state,
            conn_id: ConnectionId::generate(),
        }
    }

    pub async fn run(self) {
        let Self {
            socket,
            state,
            conn_id,
        } = self;
        info!(conn_id = %conn_id, "WebSocket 连接已建立");

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        state.registry.attach(conn_id, frame_tx.clone());

        let (mut sender, mut incoming) = socket.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：出站帧和控制命令统一经此写出
        let send_task: JoinHandle<()> = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(cmd) = cmd_rx.recv() => {
                        let result = match cmd {
                            WsCommand::SendText(text) => sender.send(WsMessage::Text(text.into())).await,
                            WsCommand::SendPing(data) => sender.send(WsMessage::Ping(data.into())).await,
                            WsCommand::SendPong(data) => sender.send(WsMessage::Pong(data.into())).await,
                            WsCommand::Close => {
                                let _ = sender.send(WsMessage::Close(None)).await;
                                break;
                            }
                        };
                        if result.is_err() {
                            break;
                        }
                    }
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else { break };
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                if sender.send(WsMessage::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "出站帧序列化失败，丢弃");
                            }
                        }
                    }
                }
            }
            debug!("WebSocket 发送任务结束");
        });

        // 心跳任务：随机抖动的探测间隔，每轮探测后重新采样。
        // 超过失联阈值没有存活信号就排一个关闭帧，并通过 shutdown
        // 信号强制接收循环退出——对端 TCP 可能还活着，不能指望它
        // 回关闭帧来结束循环。
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let heartbeat_task: JoinHandle<()> = {
            let registry = state.registry.clone();
            let policy = state.heartbeat;
            let cmd_tx = cmd_tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(policy.probe_interval()).await;
                    if registry.is_stale(conn_id, policy.stale_after()) {
                        warn!(conn_id = %conn_id, "心跳超时，断开连接");
                        let _ = cmd_tx.send(WsCommand::Close).await;
                        let _ = shutdown_tx.send(());
                        return;
                    }
                    if cmd_tx.send(WsCommand::SendPing(Vec::new())).await.is_err() {
                        return;
                    }
                }
            })
        };

        // 接收循环：入站信封解码后交给分发器
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(conn_id = %conn_id, "心跳任务要求关闭，接收循环退出");
                    break;
                }
                message = incoming.next() => {
                    let Some(Ok(message)) = message else { break };
                    match message {
                        WsMessage::Binary(bytes) => {
                            match state.codec.decode(&bytes) {
                                Ok(envelope) => {
                                    if let Err(err) = state.dispatcher.dispatch(conn_id, envelope).await {
                                        warn!(conn_id = %conn_id, error = %err, "信封分发失败");
                                        send_error(&frame_tx, None, err.to_string());
                                    }
                                }
                                // 解码失败只拒绝这一条，连接保持打开
                                Err(err) => {
                                    debug!(conn_id = %conn_id, error = %err, "信封解码失败");
                                    let (msg_id, msg) = decode_error_frame(err);
                                    send_error(&frame_tx, msg_id, msg);
                                }
                            }
                        }
                        WsMessage::Text(_) => {
                            send_error(
                                &frame_tx,
                                None,
                                "expected binary envelope, got text frame".to_string(),
                            );
                        }
                        WsMessage::Ping(data) => {
                            state.registry.touch(conn_id);
                            if cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        WsMessage::Pong(_) => {
                            state.registry.touch(conn_id);
                        }
                        WsMessage::Close(_) => {
                            debug!(conn_id = %conn_id, "收到关闭帧");
                            break;
                        }
                    }
                }
            }
        }

        // 清理：先停心跳，再注销连接，最后把连接声明过的身份
        // 从在线状态里清掉
        heartbeat_task.abort();
        send_task.abort();
        for (room_id, sender_id) in state.registry.detach(conn_id) {
            if let Err(err) = state.presence.clear(&room_id, &sender_id).await {
                warn!(room_id = %room_id, sender_id = %sender_id, error = %err, "在线状态清理失败");
            }
        }
        info!(conn_id = %conn_id, "WebSocket 连接已断开并清理");
    }
}

fn send_error(
    frame_tx: &mpsc::UnboundedSender<OutboundFrame>,
    msg_id: Option<String>,
    msg: String,
) {
    let _ = frame_tx.send(OutboundFrame::Error { msg_id, msg });
}

fn decode_error_frame(err: DecodeError) -> (Option<String>, String) {
    match err {
        DecodeError::UnsupportedKind { ref msg_id, .. } => (msg_id.clone(), err.to_string()),
        other => (None, other.to_string()),
    }
}
