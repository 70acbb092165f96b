//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 网关入口和少量运维端点，协议语义
//! 全部委托给应用层。

mod error;
mod routes;
mod state;
mod ws_connection;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
