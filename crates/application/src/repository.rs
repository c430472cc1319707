use async_trait::async_trait;
use domain::{ConversationKey, Identity, Message};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Request(String),
    #[error("history response could not be decoded: {0}")]
    Decode(String),
    #[error("history endpoint returned status {0}")]
    Status(u16),
}

/// 外部持久层：启动时拉取历史与用户名册，以及写入消息。
///
/// 实时核心只保证投递，不保证持久化。
#[async_trait]
pub trait ChatHistory: Send + Sync {
    /// `conversation` 为空时返回公共聊天室历史，否则返回该私聊会话历史
    async fn fetch_history(
        &self,
        conversation: Option<ConversationKey>,
    ) -> Result<Vec<Message>, HistoryError>;

    async fn fetch_identities(&self) -> Result<Vec<Identity>, HistoryError>;

    /// 写入消息，返回带持久化 id 的消息
    async fn persist(&self, message: Message) -> Result<Message, HistoryError>;
}
