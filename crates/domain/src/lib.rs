//! 实时聊天核心领域模型
//!
//! 包含身份、消息、会话键以及对外发布的事件类型。不做任何 I/O。

pub mod errors;
pub mod events;
pub mod message;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use events::*;
pub use message::*;
pub use value_objects::*;
