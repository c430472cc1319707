//! 消息分发门面
//!
//! 界面层唯一的订阅点：把路由器的输出合并成一条带标签的有序事件流，
//! 并暴露类型化的发送操作。门面本身不做重排或批处理。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use config::AppConfig;
use domain::{ChatEvent, ConversationKey, Identity, IdentityId, Message, MessageBody};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use crate::clock::{Clock, SystemClock};
use crate::error::{BackpressureWarning, DispatchError, SessionWarning, StartupError};
use crate::presence::PresenceTracker;
use crate::repository::{ChatHistory, HistoryError};
use crate::router::{EventRouter, RouterTargets};
use crate::session::{ConnectionSession, ConnectionStatus};
use crate::transport::Transport;
use crate::typing::TypingTracker;
use crate::unread::{UnreadCounter, UnreadCounts};

struct BusInner {
    replay: Mutex<VecDeque<ChatEvent>>,
    replay_capacity: usize,
    sender: broadcast::Sender<ChatEvent>,
}

/// 带回放缓冲的事件总线
///
/// 发布与带回放的订阅在同一把锁下进行，回放内容与实时流之间既不重复也不遗漏。
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(subscriber_capacity: usize, replay_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(subscriber_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                replay: Mutex::new(VecDeque::with_capacity(replay_capacity)),
                replay_capacity,
                sender,
            }),
        }
    }

    fn replay(&self) -> std::sync::MutexGuard<'_, VecDeque<ChatEvent>> {
        self.inner
            .replay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remember(&self, replay: &mut VecDeque<ChatEvent>, event: ChatEvent) {
        if self.inner.replay_capacity == 0 {
            return;
        }
        if replay.len() >= self.inner.replay_capacity {
            replay.pop_front();
        }
        replay.push_back(event);
    }

    pub fn publish(&self, event: ChatEvent) {
        let mut replay = self.replay();
        self.remember(&mut replay, event.clone());
        // 没有订阅者时发送失败是正常的
        let _ = self.inner.sender.send(event);
    }

    /// 只写入回放缓冲，不推给实时订阅者（用于启动时的历史）
    pub fn seed(&self, events: impl IntoIterator<Item = ChatEvent>) {
        let mut replay = self.replay();
        for event in events {
            self.remember(&mut replay, event);
        }
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.inner.sender.subscribe(),
        }
    }

    pub fn subscribe_with_replay(&self) -> (Vec<ChatEvent>, EventStream) {
        let replay = self.replay();
        let stream = EventStream {
            receiver: self.inner.sender.subscribe(),
        };
        (replay.iter().cloned().collect(), stream)
    }
}

/// 事件流
///
/// 慢订阅者落后超过缓冲容量时丢弃最旧的事件并继续，不影响其他组件的状态更新。
pub struct EventStream {
    receiver: broadcast::Receiver<ChatEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "订阅者处理过慢，跳过部分事件");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

pub struct DispatchDependencies {
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub history: Option<Arc<dyn ChatHistory>>,
}

impl DispatchDependencies {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            clock: Arc::new(SystemClock),
            history: None,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn ChatHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// 消息分发门面，每个登录身份一个实例
pub struct MessageDispatch {
    identity: Identity,
    session: ConnectionSession,
    router: EventRouter,
    presence: PresenceTracker,
    typing: TypingTracker,
    unread: Arc<UnreadCounter>,
    bus: EventBus,
    history: Option<Arc<dyn ChatHistory>>,
    clock: Arc<dyn Clock>,
    roster: Vec<Identity>,
}

impl MessageDispatch {
    /// 拉取启动历史（若有），建立会话，启动路由
    pub async fn connect(
        identity: Identity,
        deps: DispatchDependencies,
        config: &AppConfig,
    ) -> Result<Self, StartupError> {
        let bus = EventBus::new(
            config.dispatch.subscriber_capacity,
            config.dispatch.replay_capacity,
        );

        let mut roster = Vec::new();
        if let Some(history) = &deps.history {
            match history.fetch_history(None).await {
                Ok(messages) => {
                    tracing::info!(count = messages.len(), "已加载公共聊天室历史");
                    bus.seed(messages.into_iter().map(ChatEvent::PublicMessage));
                }
                Err(err) => tracing::warn!(error = %err, "加载历史失败，继续建立实时连接"),
            }
            match history.fetch_identities().await {
                Ok(identities) => roster = identities,
                Err(err) => tracing::warn!(error = %err, "加载用户名册失败"),
            }
        }

        let announcements = EventRouter::announcements(&identity)?;
        let session = ConnectionSession::open(
            identity.id().clone(),
            deps.transport,
            announcements,
            &config.session,
        )
        .await?;

        let targets = RouterTargets {
            presence: PresenceTracker::new(),
            typing: TypingTracker::new(config.typing.ttl()),
            unread: Arc::new(UnreadCounter::new(identity.id().clone())),
            bus: bus.clone(),
        };
        let router = EventRouter::new(
            identity.clone(),
            session.clone(),
            targets.clone(),
            deps.clock.clone(),
        );
        if let Err(err) = router.start() {
            session.close().await;
            return Err(err.into());
        }

        tracing::info!(identity = %identity.id(), "消息分发已就绪");
        Ok(Self {
            identity,
            session,
            router,
            presence: targets.presence,
            typing: targets.typing,
            unread: targets.unread,
            bus,
            history: deps.history,
            clock: deps.clock,
            roster,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// 最近的事件（含启动历史）加上此后的实时流
    pub fn subscribe_with_replay(&self) -> (Vec<ChatEvent>, EventStream) {
        self.bus.subscribe_with_replay()
    }

    /// 发送公共消息；配置了历史存储时再尽力写入一份
    pub fn send_public(&self, body: &str) -> Result<Option<BackpressureWarning>, DispatchError> {
        let warning = self.router.send_public(body)?;
        if let Some(history) = &self.history {
            let message = Message::public(
                self.identity.clone(),
                MessageBody::parse(body)?,
                self.clock.now(),
            );
            let history = history.clone();
            tokio::spawn(async move {
                if let Err(err) = history.persist(message).await {
                    tracing::warn!(error = %err, "公共消息写入存储失败");
                }
            });
        }
        Ok(warning)
    }

    pub fn send_private(
        &self,
        recipient: &str,
        body: &str,
    ) -> Result<Option<BackpressureWarning>, DispatchError> {
        let recipient = IdentityId::parse(recipient)?;
        self.router.send_private(&recipient, body)
    }

    pub fn set_typing(
        &self,
        conversation: Option<ConversationKey>,
        is_typing: bool,
    ) -> Result<Option<BackpressureWarning>, DispatchError> {
        self.router.set_typing(conversation, is_typing)
    }

    /// 开始显示某个私聊会话
    pub fn view_conversation(&self, key: ConversationKey) {
        self.unread.on_conversation_viewed(key);
    }

    /// 离开私聊会话（例如回到公共聊天室）
    pub fn leave_conversation(&self) {
        self.unread.clear_active_conversation();
    }

    /// 按需拉取某个私聊会话的历史
    pub async fn conversation_history(
        &self,
        key: ConversationKey,
    ) -> Result<Vec<Message>, HistoryError> {
        match &self.history {
            Some(history) => history.fetch_history(Some(key)).await,
            None => Ok(Vec::new()),
        }
    }

    /// 启动时加载的用户名册
    pub fn roster(&self) -> &[Identity] {
        &self.roster
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn unread(&self) -> &UnreadCounter {
        &self.unread
    }

    pub fn unread_counts(&self) -> watch::Receiver<UnreadCounts> {
        self.unread.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.session.status()
    }

    pub fn warnings(&self) -> broadcast::Receiver<SessionWarning> {
        self.session.warnings()
    }

    /// 通告下线并拆除会话。可重复调用。
    pub async fn close(&self) {
        self.session.close().await;
        self.router.stop();
        self.typing.clear();
    }
}
