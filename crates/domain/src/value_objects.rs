use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 用户唯一标识（不透明字符串，由认证层签发）。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityId(String);

impl IdentityId {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::empty("identity_id"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdentityId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<IdentityId> for String {
    fn from(value: IdentityId) -> Self {
        value.0
    }
}

/// 已认证的用户身份。
///
/// 签发后不可变：没有任何修改方法，消息与在线记录只持有它的克隆。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "IdentityRecord")]
pub struct Identity {
    id: IdentityId,
    #[serde(rename = "displayName")]
    display_name: String,
}

/// 反序列化用的原始结构，兼容 `_id` 与 `username` 字段。
#[derive(Deserialize)]
struct IdentityRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "_id")]
    legacy_id: Option<String>,
    #[serde(rename = "displayName", alias = "username")]
    display_name: String,
}

impl TryFrom<IdentityRecord> for Identity {
    type Error = DomainError;

    fn try_from(value: IdentityRecord) -> Result<Self, Self::Error> {
        let id = value
            .id
            .or(value.legacy_id)
            .ok_or(DomainError::empty("identity_id"))?;
        Identity::new(IdentityId::parse(id)?, value.display_name)
    }
}

impl Identity {
    pub fn new(id: IdentityId, display_name: impl Into<String>) -> Result<Self, DomainError> {
        let display_name = display_name.into().trim().to_owned();
        if display_name.is_empty() {
            return Err(DomainError::empty("display_name"));
        }
        Ok(Self { id, display_name })
    }

    pub fn id(&self) -> &IdentityId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// 持久化后由外部存储分配的消息标识。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 经过验证的消息正文：去除首尾空白后不能为空。
///
/// 原文按发送时的样子保存，不做裁剪。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageBody(String);

impl MessageBody {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::empty("body"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MessageBody {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<MessageBody> for String {
    fn from(value: MessageBody) -> Self {
        value.0
    }
}

/// 私聊会话键：两个参与者按字典序排列的无序对。
///
/// `between(a, b)` 与 `between(b, a)` 得到同一个键。线上格式为 `[low, high]`。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "(IdentityId, IdentityId)")]
pub struct ConversationKey(IdentityId, IdentityId);

impl ConversationKey {
    pub fn between(a: &IdentityId, b: &IdentityId) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }

    pub fn participants(&self) -> (&IdentityId, &IdentityId) {
        (&self.0, &self.1)
    }

    pub fn includes(&self, id: &IdentityId) -> bool {
        &self.0 == id || &self.1 == id
    }

    /// 返回会话中除 `me` 之外的另一方
    pub fn other(&self, me: &IdentityId) -> Result<&IdentityId, DomainError> {
        if &self.0 == me {
            Ok(&self.1)
        } else if &self.1 == me {
            Ok(&self.0)
        } else {
            Err(DomainError::NotAParticipant {
                identity: me.to_string(),
                conversation: self.to_string(),
            })
        }
    }
}

impl From<(IdentityId, IdentityId)> for ConversationKey {
    fn from((a, b): (IdentityId, IdentityId)) -> Self {
        Self::between(&a, &b)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> IdentityId {
        IdentityId::parse(value).unwrap()
    }

    #[test]
    fn conversation_key_is_order_independent() {
        let alice = id("alice");
        let bob = id("bob");

        assert_eq!(
            ConversationKey::between(&alice, &bob),
            ConversationKey::between(&bob, &alice)
        );
        assert_eq!(ConversationKey::between(&bob, &alice).to_string(), "alice:bob");
    }

    #[test]
    fn conversation_key_other_participant() {
        let key = ConversationKey::between(&id("b"), &id("a"));
        assert_eq!(key.other(&id("a")).unwrap(), &id("b"));
        assert_eq!(key.other(&id("b")).unwrap(), &id("a"));
        assert!(matches!(
            key.other(&id("c")),
            Err(DomainError::NotAParticipant { .. })
        ));
    }

    #[test]
    fn conversation_key_deserialize_canonicalizes() {
        let key: ConversationKey = serde_json::from_str(r#"["zed","amy"]"#).unwrap();
        assert_eq!(key, ConversationKey::between(&id("amy"), &id("zed")));
        assert_eq!(serde_json::to_string(&key).unwrap(), r#"["amy","zed"]"#);
    }

    #[test]
    fn blank_body_is_rejected() {
        assert_eq!(MessageBody::parse(""), Err(DomainError::empty("body")));
        assert_eq!(MessageBody::parse("  \t "), Err(DomainError::empty("body")));
        assert_eq!(MessageBody::parse(" hi ").unwrap().as_str(), " hi ");
    }

    #[test]
    fn identity_accepts_legacy_field_names() {
        let identity: Identity =
            serde_json::from_str(r#"{"_id":"65f0","username":"neo"}"#).unwrap();
        assert_eq!(identity.id().as_str(), "65f0");
        assert_eq!(identity.display_name(), "neo");

        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json, serde_json::json!({"id": "65f0", "displayName": "neo"}));
    }

    #[test]
    fn identity_prefers_id_over_legacy_id() {
        let identity: Identity =
            serde_json::from_str(r#"{"_id":"old","id":"new","username":"neo","password":"x"}"#)
                .unwrap();
        assert_eq!(identity.id().as_str(), "new");
    }

    #[test]
    fn identity_rejects_blank_id() {
        let result = serde_json::from_str::<Identity>(r#"{"id":"  ","displayName":"x"}"#);
        assert!(result.is_err());
    }
}
