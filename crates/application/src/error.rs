use domain::{DomainError, IdentityId};
use thiserror::Error;

use crate::frame::FrameError;
use crate::transport::TransportError;

/// 调用方输入错误：同步返回，从不重试，也不会发出任何帧。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message body is empty")]
    EmptyBody,
    #[error("missing identity: {0}")]
    MissingIdentity(&'static str),
    #[error("{identity} is not a participant of conversation {conversation}")]
    NotAParticipant {
        identity: String,
        conversation: String,
    },
}

impl From<DomainError> for ValidationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::EmptyField { field: "body" } => ValidationError::EmptyBody,
            DomainError::EmptyField { field } => ValidationError::MissingIdentity(field),
            DomainError::ValidationError { field, .. } => ValidationError::MissingIdentity(field),
            DomainError::NotAParticipant {
                identity,
                conversation,
            } => ValidationError::NotAParticipant {
                identity,
                conversation,
            },
        }
    }
}

/// 连接建立失败。重试预算耗尽后才会交给调用方，属于终态。
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("channel unavailable after {attempts} attempts: {last_error}")]
    Unavailable {
        attempts: u32,
        last_error: TransportError,
    },
    #[error("session closed while connecting")]
    Closed,
}

/// 缓冲区方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDirection {
    Inbound,
    Outbound,
}

/// 非致命告警：缓冲区已满，丢弃了一帧。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{direction:?} buffer full (capacity {capacity}), dropped one frame")]
pub struct BackpressureWarning {
    pub direction: BufferDirection,
    pub capacity: usize,
}

/// 私聊消息已发出，但在收到回显之前连接断开：发送方无法区分“已送达”与“丢失”，
/// 应按丢失处理并依赖历史重新拉取。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("delivery of private message to {recipient} is ambiguous")]
pub struct DeliveryAmbiguity {
    pub recipient: IdentityId,
    pub body: String,
}

/// 会话旁路告警，供界面展示或记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionWarning {
    Backpressure(BackpressureWarning),
    DeliveryAmbiguity(DeliveryAmbiguity),
}

/// 会话使用错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is offline: reconnect attempts exhausted")]
    Offline,
    #[error("session is closed")]
    Closed,
    #[error("inbound frames already have a consumer")]
    InboundAlreadyTaken,
}

/// 对外发送操作的错误
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        DispatchError::Validation(value.into())
    }
}

/// 门面启动失败
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}
