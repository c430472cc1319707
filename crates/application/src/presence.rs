use domain::{Identity, IdentityId, PresenceSet};
use tokio::sync::watch;

/// 在线状态跟踪器
///
/// 唯一持有在线集合的组件：只能通过 `mark_connected` / `mark_disconnected`
/// （或批量的 `apply_snapshot`）修改，外部只能读快照或订阅。
/// 订阅方每次变化收到完整集合而不是差量；慢订阅者只会看到最新值。
#[derive(Clone)]
pub struct PresenceTracker {
    state: watch::Sender<PresenceSet>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PresenceSet::new());
        Self { state }
    }

    /// 标记上线；重复调用不产生事件。返回集合是否变化
    pub fn mark_connected(&self, identity: Identity) -> bool {
        let id = identity.id().clone();
        let changed = self.state.send_if_modified(|set| set.insert(identity));
        if changed {
            tracing::info!(identity = %id, "用户上线");
        }
        changed
    }

    /// 标记下线；重复调用不产生事件。返回集合是否变化
    pub fn mark_disconnected(&self, id: &IdentityId) -> bool {
        let changed = self.state.send_if_modified(|set| set.remove(id));
        if changed {
            tracing::info!(identity = %id, "用户下线");
        }
        changed
    }

    /// 用对端广播的完整集合替换本地集合，只在确有变化时通知一次
    pub fn apply_snapshot(&self, connected: impl IntoIterator<Item = Identity>) -> bool {
        let incoming: PresenceSet = connected.into_iter().collect();
        self.state.send_if_modified(|set| {
            if *set == incoming {
                return false;
            }
            *set = incoming;
            true
        })
    }

    pub fn snapshot(&self) -> PresenceSet {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self, id: &IdentityId) -> bool {
        self.state.borrow().contains(id)
    }

    /// 订阅完整集合；接收端首先可以读到当前值
    pub fn subscribe(&self) -> watch::Receiver<PresenceSet> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> Identity {
        Identity::new(IdentityId::parse(id).unwrap(), format!("user-{id}")).unwrap()
    }

    fn ids(set: &PresenceSet) -> Vec<String> {
        set.ids().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_repeated_calls_are_idempotent() {
        let tracker = PresenceTracker::new();
        assert!(tracker.mark_connected(identity("a")));
        assert!(!tracker.mark_connected(identity("a")));
        assert!(tracker.mark_disconnected(identity("a").id()));
        assert!(!tracker.mark_disconnected(identity("a").id()));
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_follows_last_effective_call() {
        let tracker = PresenceTracker::new();
        let ops: &[(&str, bool)] = &[
            ("a", true),
            ("b", true),
            ("a", true),
            ("c", true),
            ("b", false),
            ("b", false),
            ("d", false),
            ("c", false),
            ("c", true),
        ];

        // 参照模型：每个身份最后一次调用决定其是否在线
        let mut expected = std::collections::BTreeMap::new();
        for (id, connect) in ops {
            if *connect {
                tracker.mark_connected(identity(id));
            } else {
                tracker.mark_disconnected(identity(id).id());
            }
            expected.insert(id.to_string(), *connect);
            let online: Vec<String> = expected
                .iter()
                .filter(|(_, online)| **online)
                .map(|(id, _)| id.clone())
                .collect();
            assert_eq!(ids(&tracker.snapshot()), online);
        }
        assert_eq!(ids(&tracker.snapshot()), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_full_set_on_change_only() {
        let tracker = PresenceTracker::new();
        let mut rx = tracker.subscribe();

        tracker.mark_connected(identity("a"));
        rx.changed().await.unwrap();
        assert_eq!(ids(&rx.borrow_and_update()), vec!["a"]);

        tracker.mark_connected(identity("b"));
        rx.changed().await.unwrap();
        assert_eq!(ids(&rx.borrow_and_update()), vec!["a", "b"]);

        // 无变化的调用不唤醒订阅者
        tracker.mark_connected(identity("b"));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_apply_snapshot_replaces_set() {
        let tracker = PresenceTracker::new();
        tracker.mark_connected(identity("a"));
        tracker.mark_connected(identity("b"));

        assert!(tracker.apply_snapshot(vec![identity("b"), identity("c")]));
        assert_eq!(ids(&tracker.snapshot()), vec!["b", "c"]);
        assert!(!tracker.apply_snapshot(vec![identity("c"), identity("b")]));
    }
}
