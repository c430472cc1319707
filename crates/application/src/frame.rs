//! 线上帧格式
//!
//! 所有帧都是带 `kind` 标签的 JSON 对象。入站分类先看 `kind`，
//! 只有缺少 `kind` 的旧帧才按字段推断：同时带发送方和接收方为私聊，只带发送方为公共消息，
//! 其余一律当作系统通知原样转发。

use domain::{
    ConversationKey, DomainError, Identity, IdentityId, Message, MessageBody, MessageId, Notification,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// 输入状态帧，上下行同构
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingFrame {
    /// 旧帧只带 `username`，见 [`TypingFrame::sender`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<IdentityId>,
    #[serde(alias = "username")]
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<ConversationKey>,
    pub is_typing: bool,
}

impl TypingFrame {
    /// 发送方标识；缺少 `senderId` 时以用户名作为标识
    pub fn sender(&self) -> Result<IdentityId, DomainError> {
        match &self.sender_id {
            Some(id) => Ok(id.clone()),
            None => IdentityId::parse(self.sender_name.as_str()),
        }
    }
}

/// 客户端发往对端的帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// 上线通告，连接建立及每次重连后发送
    Join { identity: Identity },
    /// 下线通告，关闭时尽力发送
    Leave { identity_id: IdentityId },
    Public {
        sender_id: IdentityId,
        sender_name: String,
        body: MessageBody,
    },
    Private {
        sender_id: IdentityId,
        receiver_id: IdentityId,
        body: MessageBody,
        created_at: Timestamp,
    },
    Typing(TypingFrame),
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// 对端投递给客户端的帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Public {
        #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
        id: Option<MessageId>,
        #[serde(alias = "user")]
        sender: Identity,
        #[serde(alias = "text", alias = "content")]
        body: MessageBody,
        created_at: Timestamp,
    },
    Private {
        #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
        id: Option<MessageId>,
        #[serde(alias = "user")]
        sender: Identity,
        #[serde(alias = "recipient")]
        receiver: Identity,
        #[serde(alias = "text", alias = "content")]
        body: MessageBody,
        created_at: Timestamp,
    },
    Presence {
        connected: Vec<Identity>,
    },
    Typing(TypingFrame),
    Notification {
        message: String,
    },
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_message(message: &Message) -> Self {
        match &message.recipient {
            Some(receiver) => ServerFrame::Private {
                id: message.id.clone(),
                sender: message.sender.clone(),
                receiver: receiver.clone(),
                body: message.body.clone(),
                created_at: message.created_at,
            },
            None => ServerFrame::Public {
                id: message.id.clone(),
                sender: message.sender.clone(),
                body: message.body.clone(),
                created_at: message.created_at,
            },
        }
    }
}

/// 分类后的入站帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Public(Message),
    Private(Message),
    Presence(Vec<Identity>),
    Typing {
        identity: Identity,
        conversation: Option<ConversationKey>,
        is_typing: bool,
    },
    Notification(Notification),
}

const KNOWN_KINDS: [&str; 4] = ["public", "private", "presence", "typing"];

/// 把一帧文本分类为入站事件
pub fn classify(text: &str) -> Result<Inbound, FrameError> {
    let mut map = match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => map,
        other => {
            return Ok(Inbound::Notification(Notification {
                message: other.as_str().map(str::to_owned).unwrap_or_default(),
                payload: Some(other),
            }))
        }
    };

    let kind = match map.get("kind").and_then(Value::as_str) {
        Some(kind) => kind.to_owned(),
        None => infer_kind(&map).to_owned(),
    };

    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Ok(Inbound::Notification(opaque_notification(map)));
    }

    map.insert("kind".into(), Value::String(kind));
    let frame: ServerFrame = serde_json::from_value(Value::Object(map))?;
    Ok(match frame {
        ServerFrame::Public {
            id,
            sender,
            body,
            created_at,
        } => Inbound::Public(Message {
            id,
            sender,
            recipient: None,
            body,
            created_at,
        }),
        ServerFrame::Private {
            id,
            sender,
            receiver,
            body,
            created_at,
        } => Inbound::Private(Message {
            id,
            sender,
            recipient: Some(receiver),
            body,
            created_at,
        }),
        ServerFrame::Presence { connected } => Inbound::Presence(connected),
        ServerFrame::Typing(typing) => Inbound::Typing {
            identity: Identity::new(typing.sender()?, typing.sender_name)?,
            conversation: typing.conversation_key,
            is_typing: typing.is_typing,
        },
        ServerFrame::Notification { message } => Inbound::Notification(Notification::new(message)),
    })
}

/// 缺少 `kind` 的旧帧按字段推断类型
fn infer_kind(map: &Map<String, Value>) -> &'static str {
    if map.contains_key("isTyping") {
        return "typing";
    }
    let has_sender = map.contains_key("sender") || map.contains_key("user");
    let has_receiver = map.contains_key("receiver") || map.contains_key("recipient");
    match (has_sender, has_receiver) {
        (true, true) => "private",
        (true, false) => "public",
        _ => "notification",
    }
}

fn opaque_notification(map: Map<String, Value>) -> Notification {
    let message = map
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    Notification {
        message,
        payload: Some(Value::Object(map)),
    }
}

impl From<DomainError> for FrameError {
    fn from(value: DomainError) -> Self {
        FrameError::Malformed(serde::de::Error::custom(value))
    }
}
