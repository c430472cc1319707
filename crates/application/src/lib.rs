//! 实时消息同步核心。
//!
//! 一条持久连接上复用公共消息、私聊、在线状态与输入状态，
//! 并维护由这些事件派生的状态（在线集合、输入标志、未读计数）。
//! 界面层只通过 [`MessageDispatch`] 订阅事件与发送消息。

pub mod clock;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod presence;
pub mod repository;
pub mod retry;
pub mod router;
pub mod session;
pub mod transport;
pub mod typing;
pub mod unread;

pub use clock::{Clock, FixedClock, SystemClock};
pub use dispatch::{DispatchDependencies, EventBus, EventStream, MessageDispatch};
pub use error::{
    BackpressureWarning, BufferDirection, ConnectionError, DeliveryAmbiguity, DispatchError,
    SessionError, SessionWarning, StartupError, ValidationError,
};
pub use frame::{classify, ClientFrame, FrameError, Inbound, ServerFrame, TypingFrame};
pub use presence::PresenceTracker;
pub use repository::{ChatHistory, HistoryError};
pub use retry::{retry_async, Backoff, RetryError, RetryPolicy};
pub use router::{EventRouter, RouterTargets};
pub use session::{Announcements, ConnectionSession, ConnectionStatus};
pub use transport::{Channel, FrameSink, FrameSource, Transport, TransportError};
pub use typing::TypingTracker;
pub use unread::{UnreadCounter, UnreadCounts};
