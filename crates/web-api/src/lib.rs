//! 聊天中继服务。
//!
//! 接受客户端的 WebSocket 连接，维护在线集合，并按帧类型转发公共消息、私聊与输入状态。
//! 另提供健康检查与在线用户查询的 HTTP 接口。

mod error;
mod hub;
mod routes;
mod state;
mod ws_connection;

pub use error::{ApiError, RelayError};
pub use hub::SessionHub;
pub use routes::router;
pub use state::RelayState;
pub use ws_connection::RelayConnection;
