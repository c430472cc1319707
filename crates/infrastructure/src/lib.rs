//! 基础设施层实现。
//!
//! 提供应用层接口的具体适配器：基于 WebSocket 的传输层，以及访问外部 HTTP 接口的历史与名册读取。

pub mod http_history;
pub mod websocket;

pub use http_history::HttpChatHistory;
pub use websocket::WebSocketTransport;
