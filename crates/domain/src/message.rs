use serde::{Deserialize, Serialize};

use crate::value_objects::{ConversationKey, Identity, MessageBody, MessageId, Timestamp};

/// 聊天消息。
///
/// `recipient` 为空表示公共房间广播，否则为私聊。创建后不再修改，
/// `id` 只在外部存储确认后才存在。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub sender: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Identity>,
    pub body: MessageBody,
    pub created_at: Timestamp,
}

impl Message {
    pub fn public(sender: Identity, body: MessageBody, created_at: Timestamp) -> Self {
        Self {
            id: None,
            sender,
            recipient: None,
            body,
            created_at,
        }
    }

    pub fn private(
        sender: Identity,
        recipient: Identity,
        body: MessageBody,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: None,
            sender,
            recipient: Some(recipient),
            body,
            created_at,
        }
    }

    /// 附加外部存储分配的持久化标识
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn is_private(&self) -> bool {
        self.recipient.is_some()
    }

    /// 私聊消息的会话键；公共消息返回 `None`
    pub fn conversation_key(&self) -> Option<ConversationKey> {
        self.recipient
            .as_ref()
            .map(|recipient| ConversationKey::between(self.sender.id(), recipient.id()))
    }
}
