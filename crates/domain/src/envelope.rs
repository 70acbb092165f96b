//! 信封：一条线上消息解码后的不可变单元。
//!
//! 一个信封恰好触发一次处理器分发。

use crate::ids::{MessageId, RoomId, SenderId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 信封类型判别器
///
/// 封闭枚举：分发表在编译期做穷尽检查，未知判别器在解码层
/// 被拒绝，不会进入分发逻辑。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Presence,
    Message,
    ReadReceipt,
}

impl EnvelopeKind {
    /// 线上判别器字符串 → 枚举，未知返回 None
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "presence" => Some(Self::Presence),
            "message" => Some(Self::Message),
            "read_receipt" => Some(Self::ReadReceipt),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Presence => "presence",
            Self::Message => "message",
            Self::ReadReceipt => "read_receipt",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// 解码后的信封
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub room_id: RoomId,
    pub sender_id: SenderId,
    pub msg_id: MessageId,
    /// 不透明负载，网关不解释内容
    pub payload: Vec<u8>,
}
