//! 信封编解码器
//!
//! 线上格式是 protobuf 编码的 `WireEnvelope`（见 `proto/envelope.proto`）。
//! 解码失败只拒绝这一条消息，调用方向来源连接回一个结构化错误帧，
//! 绝不因此关闭连接。

use crate::schema::SchemaManifest;
use domain::{Envelope, EnvelopeKind, MessageId, RoomId, SenderId};
use once_cell::sync::OnceCell;
use prost::Message as ProstMessage;
use std::sync::Arc;
use thiserror::Error;

/// 线上信封，与 `proto/envelope.proto` 保持一致
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireEnvelope {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub kind: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub room_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub sender_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub msg_id: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "6")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// 模式清单尚未加载完成，所有输入都被拒绝
    #[error("envelope schema not loaded yet")]
    SchemaUnavailable,
    /// 字节不符合模式
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// 判别器不在封闭枚举内；携带 msg_id 以便回错误帧
    #[error("unsupported envelope kind {kind:?}")]
    UnsupportedKind { kind: String, msg_id: Option<String> },
}

/// 信封编解码器
///
/// 模式单元由 `SchemaLoader` 异步填充；填充前 `decode` 一律返回
/// `SchemaUnavailable`。
pub struct EnvelopeCodec {
    schema: Arc<OnceCell<SchemaManifest>>,
}

impl EnvelopeCodec {
    /// 当前线上协议版本
    pub const PROTOCOL_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            schema: Arc::new(OnceCell::new()),
        }
    }

    /// 用已就绪的清单构造，测试和本地运行用
    pub fn with_manifest(manifest: SchemaManifest) -> Self {
        let cell = OnceCell::new();
        cell.set(manifest).expect("fresh cell cannot be occupied");
        Self {
            schema: Arc::new(cell),
        }
    }

    /// 交给 `SchemaLoader` 填充的模式单元
    pub fn schema_handle(&self) -> Arc<OnceCell<SchemaManifest>> {
        Arc::clone(&self.schema)
    }

    pub fn is_ready(&self) -> bool {
        self.schema.get().is_some()
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let schema = self.schema.get().ok_or(DecodeError::SchemaUnavailable)?;

        let wire = WireEnvelope::decode(bytes)
            .map_err(|err| DecodeError::Malformed(err.to_string()))?;

        if !schema.supports_version(wire.version) {
            return Err(DecodeError::Malformed(format!(
                "unsupported envelope version {}",
                wire.version
            )));
        }
        if wire.room_id.is_empty() {
            return Err(DecodeError::Malformed("empty room_id".to_string()));
        }
        if wire.sender_id.is_empty() {
            return Err(DecodeError::Malformed("empty sender_id".to_string()));
        }
        if wire.msg_id.is_empty() {
            return Err(DecodeError::Malformed("empty msg_id".to_string()));
        }
        if wire.payload.len() > schema.max_payload_bytes {
            return Err(DecodeError::Malformed(format!(
                "payload of {} bytes exceeds limit {}",
                wire.payload.len(),
                schema.max_payload_bytes
            )));
        }

        let kind = match EnvelopeKind::from_wire(&wire.kind) {
            Some(kind) if schema.kind_enabled(&wire.kind) => kind,
            _ => {
                return Err(DecodeError::UnsupportedKind {
                    kind: wire.kind,
                    msg_id: Some(wire.msg_id),
                })
            }
        };

        Ok(Envelope {
            kind,
            room_id: RoomId::new(wire.room_id),
            sender_id: SenderId::new(wire.sender_id),
            msg_id: MessageId::new(wire.msg_id),
            payload: wire.payload,
        })
    }

    /// 编码一个信封；客户端和测试用
    pub fn encode(&self, envelope: &Envelope) -> Vec<u8> {
        WireEnvelope {
            version: Self::PROTOCOL_VERSION,
            kind: envelope.kind.as_wire().to_string(),
            room_id: envelope.room_id.as_str().to_string(),
            sender_id: envelope.sender_id.as_str().to_string(),
            msg_id: envelope.msg_id.as_str().to_string(),
            payload: envelope.payload.clone(),
        }
        .encode_to_vec()
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}
