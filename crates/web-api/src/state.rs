use std::sync::Arc;

use application::{Clock, PresenceTracker, ServerFrame, SystemClock};
use config::RelayConfig;
use domain::Identity;
use tokio::task::JoinHandle;

use crate::hub::SessionHub;

#[derive(Clone)]
pub struct RelayState {
    pub presence: PresenceTracker,
    pub hub: Arc<SessionHub>,
    pub clock: Arc<dyn Clock>,
}

impl RelayState {
    /// 创建中继状态并启动在线集合的广播任务，需在 tokio 运行时内调用
    pub fn new(config: &RelayConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &RelayConfig, clock: Arc<dyn Clock>) -> Self {
        let state = Self {
            presence: PresenceTracker::new(),
            hub: Arc::new(SessionHub::new(config.session_capacity)),
            clock,
        };
        spawn_presence_fanout(&state);
        state
    }
}

/// 在线集合每次变化都把完整集合推给所有连接
fn spawn_presence_fanout(state: &RelayState) -> JoinHandle<()> {
    let mut changes = state.presence.subscribe();
    let hub = state.hub.clone();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let connected: Vec<Identity> = changes.borrow_and_update().iter().cloned().collect();
            let count = connected.len();
            match (ServerFrame::Presence { connected }).encode() {
                Ok(frame) => {
                    tracing::debug!(count, "广播在线用户列表");
                    hub.broadcast(&frame, None).await;
                }
                Err(err) => tracing::warn!(error = %err, "在线列表序列化失败"),
            }
        }
    })
}
