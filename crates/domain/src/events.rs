//! 对外发布的聊天事件
//!
//! 所有界面只需订阅一条带标签的事件流，按 `kind` 过滤即可，不必猜测结构。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::value_objects::{ConversationKey, Identity, IdentityId};

/// 当前在线的身份集合（按身份标识排序）。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceSet(BTreeMap<IdentityId, Identity>);

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入集合；返回集合是否发生变化
    pub fn insert(&mut self, identity: Identity) -> bool {
        match self.0.get(identity.id()) {
            Some(existing) if existing == &identity => false,
            _ => {
                self.0.insert(identity.id().clone(), identity);
                true
            }
        }
    }

    /// 移出集合；返回集合是否发生变化
    pub fn remove(&mut self, id: &IdentityId) -> bool {
        self.0.remove(id).is_some()
    }

    pub fn contains(&self, id: &IdentityId) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.0.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &IdentityId> {
        self.0.keys()
    }
}

impl FromIterator<Identity> for PresenceSet {
    fn from_iter<T: IntoIterator<Item = Identity>>(iter: T) -> Self {
        let mut set = PresenceSet::new();
        for identity in iter {
            set.insert(identity);
        }
        set
    }
}

/// 输入状态变化的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingCause {
    /// 对方显式发送了信号
    Signal,
    /// 超过 TTL 未收到刷新
    Expired,
}

/// 输入状态的边沿事件：只在进入或离开 Typing 时产生。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingChange {
    pub identity: Identity,
    /// `None` 表示公共房间
    pub conversation: Option<ConversationKey>,
    pub is_typing: bool,
    pub cause: TypingCause,
}

/// 系统通知，原样转发
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: None,
        }
    }
}

/// 聊天事件：单一的带标签事件流
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    PublicMessage(Message),
    PrivateMessage(Message),
    PresenceChanged(PresenceSet),
    TypingChanged(TypingChange),
    Notification(Notification),
}

impl ChatEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::PublicMessage(_) => "public_message",
            ChatEvent::PrivateMessage(_) => "private_message",
            ChatEvent::PresenceChanged(_) => "presence_changed",
            ChatEvent::TypingChanged(_) => "typing_changed",
            ChatEvent::Notification(_) => "notification",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, name: &str) -> Identity {
        Identity::new(IdentityId::parse(id).unwrap(), name).unwrap()
    }

    #[test]
    fn presence_set_reports_actual_changes_only() {
        let mut set = PresenceSet::new();
        assert!(set.insert(identity("a", "Ann")));
        assert!(!set.insert(identity("a", "Ann")));
        assert!(set.insert(identity("a", "Anna")));
        assert_eq!(set.len(), 1);

        assert!(set.remove(&IdentityId::parse("a").unwrap()));
        assert!(!set.remove(&IdentityId::parse("a").unwrap()));
        assert!(set.is_empty());
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let event = ChatEvent::Notification(Notification::new("welcome"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "notification");
        assert_eq!(json["data"]["message"], "welcome");
        assert_eq!(event.kind(), "notification");
    }
}
