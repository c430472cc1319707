//! 领域模型错误定义
//!
//! 定义了身份、消息体和会话键在构造时可能出现的错误。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 字段为空（去除首尾空白后）
    #[error("字段不能为空: {field}")]
    EmptyField { field: &'static str },

    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError {
        field: &'static str,
        message: String,
    },

    /// 会话键不包含指定参与者
    #[error("身份 {identity} 不是会话 {conversation} 的参与者")]
    NotAParticipant {
        identity: String,
        conversation: String,
    },
}

impl DomainError {
    /// 创建空字段错误
    pub fn empty(field: &'static str) -> Self {
        Self::EmptyField { field }
    }

    /// 创建验证错误
    pub fn validation_error(field: &'static str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field,
            message: message.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
