//! 网关系统核心领域模型
//!
//! 包含信封、房间/连接标识、分区周期等核心类型，以及相关的业务规则。
//! 本层不做任何 I/O。

pub mod envelope;
pub mod ids;
pub mod partition;

// 重新导出常用类型
pub use envelope::{Envelope, EnvelopeKind};
pub use ids::{ConnectionId, MessageId, RoomId, SenderId};
pub use partition::{retention_cutoff, PartitionPeriod, PeriodParseError};
