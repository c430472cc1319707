use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use domain::{ConversationKey, Identity, IdentityId, TypingCause, TypingChange};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};

type TypingKey = (IdentityId, Option<ConversationKey>);

struct TypingEntry {
    identity: Identity,
    expires_at: Instant,
    generation: u64,
    timer: AbortHandle,
}

struct TypingState {
    entries: HashMap<TypingKey, TypingEntry>,
    next_generation: u64,
}

struct TypingInner {
    ttl: Duration,
    state: Mutex<TypingState>,
    edges: broadcast::Sender<TypingChange>,
    /// 过期边沿的无损通道，每个订阅方一个
    expirations: Mutex<Vec<mpsc::UnboundedSender<TypingChange>>>,
}

impl TypingInner {
    fn lock(&self) -> MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expired(&self, change: TypingChange) {
        self.expirations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|tx| tx.send(change.clone()).is_ok());
        let _ = self.edges.send(change);
    }
}

/// 输入状态机：每个 (身份, 会话) 一个 `Idle -> Typing -> Idle`。
///
/// 重复的 `true` 只刷新过期时间，不产生新事件；显式 `false` 或超过 TTL 未刷新回到 Idle。
/// 下游只会看到进入/离开 Typing 的边沿。每个条目一个过期定时器，回到 Idle 时取消。
#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<TypingInner>,
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        let (edges, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(TypingInner {
                ttl,
                state: Mutex::new(TypingState {
                    entries: HashMap::new(),
                    next_generation: 0,
                }),
                edges,
                expirations: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// 处理一次输入信号，返回产生的边沿（若有）
    pub fn signal(
        &self,
        identity: Identity,
        conversation: Option<ConversationKey>,
        is_typing: bool,
    ) -> Option<TypingChange> {
        let key = (identity.id().clone(), conversation.clone());
        let mut state = self.inner.lock();

        let change = if is_typing {
            let expires_at = Instant::now() + self.inner.ttl;
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.expires_at = expires_at;
                return None;
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            let timer = tokio::spawn(expire_after(
                Arc::downgrade(&self.inner),
                key.clone(),
                generation,
                expires_at,
            ))
            .abort_handle();
            state.entries.insert(
                key,
                TypingEntry {
                    identity: identity.clone(),
                    expires_at,
                    generation,
                    timer,
                },
            );
            TypingChange {
                identity,
                conversation,
                is_typing: true,
                cause: TypingCause::Signal,
            }
        } else {
            let entry = state.entries.remove(&key)?;
            entry.timer.abort();
            TypingChange {
                identity: entry.identity,
                conversation,
                is_typing: false,
                cause: TypingCause::Signal,
            }
        };
        drop(state);

        let _ = self.inner.edges.send(change.clone());
        Some(change)
    }

    /// 当前处于 Typing 的条目
    pub fn snapshot(&self) -> Vec<(Identity, Option<ConversationKey>)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|((_, conversation), entry)| (entry.identity.clone(), conversation.clone()))
            .collect()
    }

    pub fn is_typing(&self, id: &IdentityId, conversation: Option<&ConversationKey>) -> bool {
        self.inner
            .lock()
            .entries
            .contains_key(&(id.clone(), conversation.cloned()))
    }

    /// 订阅所有边沿（包括信号触发和过期触发）
    pub fn subscribe(&self) -> broadcast::Receiver<TypingChange> {
        self.inner.edges.subscribe()
    }

    /// 只订阅过期触发的离开边沿。
    ///
    /// 与 [`subscribe`](Self::subscribe) 不同，这条通道不会因积压丢事件：
    /// 过期边沿是对端停止信号丢失时唯一的离开通知。
    pub fn expirations(&self) -> mpsc::UnboundedReceiver<TypingChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .expirations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// 清空所有条目并取消定时器，不产生事件
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        for (_, entry) in state.entries.drain() {
            entry.timer.abort();
        }
    }
}

/// 条目的过期定时器：到期时若期间有刷新则顺延，否则回到 Idle 并发出边沿
async fn expire_after(
    inner: std::sync::Weak<TypingInner>,
    key: TypingKey,
    generation: u64,
    mut deadline: Instant,
) {
    loop {
        sleep_until(deadline).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut state = inner.lock();
        let Some(entry) = state.entries.get(&key) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        if entry.expires_at > Instant::now() {
            deadline = entry.expires_at;
            continue;
        }
        let Some(entry) = state.entries.remove(&key) else {
            return;
        };
        drop(state);

        tracing::debug!(identity = %entry.identity.id(), "输入状态超时，回到空闲");
        inner.expired(TypingChange {
            identity: entry.identity,
            conversation: key.1,
            is_typing: false,
            cause: TypingCause::Expired,
        });
        return;
    }
}

impl Drop for TypingInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, entry) in state.entries.drain() {
            entry.timer.abort();
        }
    }
}
