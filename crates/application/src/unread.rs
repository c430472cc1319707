use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use domain::{ConversationKey, IdentityId, Message};
use tokio::sync::watch;

/// 各会话未读数的完整映射
pub type UnreadCounts = BTreeMap<ConversationKey, u32>;

/// 未读计数器
///
/// 只有“投递给查看者、且查看者当前没在看该会话”的私聊消息才会加一；
/// 只有显式的“已查看”会把计数清零。发送消息从不改变计数。
pub struct UnreadCounter {
    viewer: IdentityId,
    active: Mutex<Option<ConversationKey>>,
    counts: watch::Sender<UnreadCounts>,
}

impl UnreadCounter {
    pub fn new(viewer: IdentityId) -> Self {
        let (counts, _) = watch::channel(UnreadCounts::new());
        Self {
            viewer,
            active: Mutex::new(None),
            counts,
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ConversationKey>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 私聊消息投递后调用，返回是否计入未读
    pub fn on_private_message_delivered(&self, message: &Message) -> bool {
        let Some(key) = message.conversation_key() else {
            tracing::warn!(sender = %message.sender.id(), "公共消息不计入私聊未读，已忽略");
            return false;
        };
        if !key.includes(&self.viewer) {
            tracing::warn!(viewer = %self.viewer, conversation = %key, "消息不属于当前用户的会话，已忽略");
            return false;
        }
        // 自己发出的消息回显不算未读
        if message.sender.id() == &self.viewer {
            return false;
        }

        let active = self.active();
        if active.as_ref() == Some(&key) {
            return false;
        }
        self.counts.send_modify(|counts| {
            let count = counts.entry(key).or_insert(0);
            *count = count.saturating_add(1);
        });
        true
    }

    /// 开始显示某个会话：清零并记为当前会话
    pub fn on_conversation_viewed(&self, key: ConversationKey) {
        let mut active = self.active();
        self.counts.send_if_modified(|counts| match counts.get_mut(&key) {
            Some(count) if *count != 0 => {
                *count = 0;
                true
            }
            Some(_) => false,
            None => {
                counts.insert(key.clone(), 0);
                true
            }
        });
        *active = Some(key);
    }

    /// 不再显示任何私聊会话
    pub fn clear_active_conversation(&self) {
        *self.active() = None;
    }

    pub fn active_conversation(&self) -> Option<ConversationKey> {
        self.active().clone()
    }

    pub fn snapshot(&self, key: &ConversationKey) -> u32 {
        self.counts.borrow().get(key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.borrow().values().sum()
    }

    /// 订阅完整映射
    pub fn subscribe(&self) -> watch::Receiver<UnreadCounts> {
        self.counts.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::{Identity, MessageBody};

    fn identity(id: &str) -> Identity {
        Identity::new(IdentityId::parse(id).unwrap(), id.to_uppercase()).unwrap()
    }

    fn private(from: &str, to: &str) -> Message {
        Message::private(
            identity(from),
            identity(to),
            MessageBody::parse("hey").unwrap(),
            Utc::now(),
        )
    }

    fn key(a: &str, b: &str) -> ConversationKey {
        ConversationKey::between(identity(a).id(), identity(b).id())
    }

    #[test]
    fn test_increments_only_when_not_viewing() {
        let counter = UnreadCounter::new(identity("me").id().clone());

        assert!(counter.on_private_message_delivered(&private("bob", "me")));
        assert!(counter.on_private_message_delivered(&private("bob", "me")));
        assert_eq!(counter.snapshot(&key("me", "bob")), 2);

        counter.on_conversation_viewed(key("bob", "me"));
        assert_eq!(counter.snapshot(&key("me", "bob")), 0);

        // 正在查看时不计数
        assert!(!counter.on_private_message_delivered(&private("bob", "me")));
        assert_eq!(counter.snapshot(&key("me", "bob")), 0);

        // 其他会话照常计数
        assert!(counter.on_private_message_delivered(&private("eve", "me")));
        assert_eq!(counter.snapshot(&key("me", "eve")), 1);

        counter.clear_active_conversation();
        assert!(counter.on_private_message_delivered(&private("bob", "me")));
        assert_eq!(counter.snapshot(&key("me", "bob")), 1);
    }

    #[test]
    fn test_own_messages_never_count() {
        let counter = UnreadCounter::new(identity("me").id().clone());
        assert!(!counter.on_private_message_delivered(&private("me", "bob")));
        assert_eq!(counter.snapshot(&key("me", "bob")), 0);
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_foreign_and_public_messages_are_skipped() {
        let counter = UnreadCounter::new(identity("me").id().clone());
        assert!(!counter.on_private_message_delivered(&private("bob", "eve")));

        let public = Message::public(identity("bob"), MessageBody::parse("all").unwrap(), Utc::now());
        assert!(!counter.on_private_message_delivered(&public));
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_viewed_resets_to_zero_and_is_idempotent() {
        let counter = UnreadCounter::new(identity("me").id().clone());
        for _ in 0..5 {
            counter.on_private_message_delivered(&private("bob", "me"));
        }
        counter.on_conversation_viewed(key("me", "bob"));
        counter.on_conversation_viewed(key("me", "bob"));
        assert_eq!(counter.snapshot(&key("me", "bob")), 0);
        assert_eq!(counter.active_conversation(), Some(key("me", "bob")));
    }

    #[tokio::test]
    async fn test_subscribers_see_full_mapping() {
        let counter = UnreadCounter::new(identity("me").id().clone());
        let mut rx = counter.subscribe();

        counter.on_private_message_delivered(&private("bob", "me"));
        rx.changed().await.unwrap();
        counter.on_private_message_delivered(&private("eve", "me"));
        rx.changed().await.unwrap();

        let counts = rx.borrow_and_update().clone();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[&key("me", "bob")], 1);
        assert_eq!(counts[&key("me", "eve")], 1);
    }
}
