//! 事件路由器
//!
//! 唯一理解线上帧结构的组件。入站方向把每一帧分类后交给对应的状态组件
//! （在线、输入、未读），再转给分发门面；出站方向校验调用方意图并编码成帧交给会话。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use domain::{
    ChatEvent, ConversationKey, Identity, IdentityId, Message, MessageBody, TypingChange,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::dispatch::EventBus;
use crate::error::{
    BackpressureWarning, DeliveryAmbiguity, DispatchError, SessionError, SessionWarning,
};
use crate::frame::{classify, ClientFrame, FrameError, Inbound, TypingFrame};
use crate::presence::PresenceTracker;
use crate::session::{Announcements, ConnectionSession};
use crate::typing::TypingTracker;
use crate::unread::UnreadCounter;

/// 已发出、尚未收到回显的私聊消息
#[derive(Debug, Clone)]
struct PendingPrivate {
    recipient: IdentityId,
    body: String,
}

/// 路由器下游的状态组件
#[derive(Clone)]
pub struct RouterTargets {
    pub presence: PresenceTracker,
    pub typing: TypingTracker,
    pub unread: Arc<UnreadCounter>,
    pub bus: EventBus,
}

struct RouterInner {
    identity: Identity,
    session: ConnectionSession,
    targets: RouterTargets,
    clock: Arc<dyn Clock>,
    pending: Mutex<VecDeque<PendingPrivate>>,
}

pub struct EventRouter {
    inner: Arc<RouterInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventRouter {
    /// 会话代发的上线/下线通告帧
    pub fn announcements(identity: &Identity) -> Result<Announcements, FrameError> {
        Ok(Announcements {
            join: ClientFrame::Join {
                identity: identity.clone(),
            }
            .encode()?,
            leave: ClientFrame::Leave {
                identity_id: identity.id().clone(),
            }
            .encode()?,
        })
    }

    pub fn new(
        identity: Identity,
        session: ConnectionSession,
        targets: RouterTargets,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                identity,
                session,
                targets,
                clock,
                pending: Mutex::new(VecDeque::new()),
            }),
            task: Mutex::new(None),
        }
    }

    /// 注册为会话唯一的入站消费者并启动路由任务
    pub fn start(&self) -> Result<(), SessionError> {
        let frames = self.inner.session.take_inbound()?;
        let disconnects = self.inner.session.disconnects();
        let expirations = self.inner.targets.typing.expirations();
        let handle = tokio::spawn(run(self.inner.clone(), frames, disconnects, expirations));
        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    /// 停止路由任务；会话本身由调用方关闭
    pub fn stop(&self) {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
        self.inner.fail_pending();
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn send_public(&self, body: &str) -> Result<Option<BackpressureWarning>, DispatchError> {
        let body = MessageBody::parse(body)?;
        let me = &self.inner.identity;
        self.inner.transmit(ClientFrame::Public {
            sender_id: me.id().clone(),
            sender_name: me.display_name().to_owned(),
            body,
        })
    }

    pub fn send_private(
        &self,
        recipient: &IdentityId,
        body: &str,
    ) -> Result<Option<BackpressureWarning>, DispatchError> {
        let body = MessageBody::parse(body)?;
        let frame = ClientFrame::Private {
            sender_id: self.inner.identity.id().clone(),
            receiver_id: recipient.clone(),
            body: body.clone(),
            created_at: self.inner.clock.now(),
        };

        // 先登记再发送：回显可能在 send 返回前就到达
        self.inner.pending().push_back(PendingPrivate {
            recipient: recipient.clone(),
            body: body.as_str().to_owned(),
        });
        let result = self.inner.transmit(frame);
        if result.is_err() {
            self.inner.pending().pop_back();
        }
        result
    }

    /// 发送输入状态；`conversation` 为空表示公共聊天室
    pub fn set_typing(
        &self,
        conversation: Option<ConversationKey>,
        is_typing: bool,
    ) -> Result<Option<BackpressureWarning>, DispatchError> {
        let me = &self.inner.identity;
        if let Some(key) = &conversation {
            key.other(me.id())?;
        }
        self.inner.transmit(ClientFrame::Typing(TypingFrame {
            sender_id: Some(me.id().clone()),
            sender_name: me.display_name().to_owned(),
            conversation_key: conversation,
            is_typing,
        }))
    }

    /// 已发出但尚未确认送达的私聊数
    pub fn pending_private(&self) -> usize {
        self.inner.pending().len()
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        if let Some(handle) = self
            .task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl RouterInner {
    fn pending(&self) -> MutexGuard<'_, VecDeque<PendingPrivate>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transmit(&self, frame: ClientFrame) -> Result<Option<BackpressureWarning>, DispatchError> {
        let text = frame.encode()?;
        Ok(self.session.send(text)?)
    }

    fn route(&self, text: &str) {
        let inbound = match classify(text) {
            Ok(inbound) => inbound,
            Err(err) => {
                tracing::warn!(identity = %self.identity.id(), error = %err, "无法解析的入站帧，已丢弃");
                return;
            }
        };

        match inbound {
            Inbound::Public(message) => self.targets.bus.publish(ChatEvent::PublicMessage(message)),
            Inbound::Private(message) => self.on_private(message),
            Inbound::Presence(connected) => {
                if self.targets.presence.apply_snapshot(connected) {
                    let snapshot = self.targets.presence.snapshot();
                    self.targets.bus.publish(ChatEvent::PresenceChanged(snapshot));
                }
            }
            Inbound::Typing {
                identity,
                conversation,
                is_typing,
            } => self.on_typing(identity, conversation, is_typing),
            Inbound::Notification(notification) => {
                self.targets.bus.publish(ChatEvent::Notification(notification))
            }
        }
    }

    fn on_private(&self, message: Message) {
        let me = self.identity.id();
        let Some(key) = message.conversation_key() else {
            return;
        };
        if !key.includes(me) {
            tracing::warn!(identity = %me, conversation = %key, "收到不属于自己的私聊消息，已忽略");
            return;
        }

        self.targets.unread.on_private_message_delivered(&message);
        if message.sender.id() == me {
            self.confirm(&message);
        }
        self.targets.bus.publish(ChatEvent::PrivateMessage(message));
    }

    /// 自己发出的私聊回显到达，视为已送达
    fn confirm(&self, message: &Message) {
        let Some(recipient) = message.recipient.as_ref() else {
            return;
        };
        let mut pending = self.pending();
        let position = pending.iter().position(|entry| {
            &entry.recipient == recipient.id() && entry.body == message.body.as_str()
        });
        if let Some(position) = position {
            pending.remove(position);
        }
    }

    fn on_typing(&self, identity: Identity, conversation: Option<ConversationKey>, is_typing: bool) {
        let me = self.identity.id();
        if identity.id() == me {
            return;
        }
        if let Some(key) = &conversation {
            if !key.includes(me) {
                tracing::warn!(identity = %me, conversation = %key, "收到不属于自己的输入状态，已忽略");
                return;
            }
        }
        if let Some(change) = self.targets.typing.signal(identity, conversation, is_typing) {
            self.targets.bus.publish(ChatEvent::TypingChanged(change));
        }
    }

    /// 连接断开时所有未确认的私聊都无法判断是否送达
    fn fail_pending(&self) {
        let drained: Vec<PendingPrivate> = self.pending().drain(..).collect();
        for entry in drained {
            tracing::warn!(
                identity = %self.identity.id(),
                recipient = %entry.recipient,
                "私聊消息送达状态不确定"
            );
            self.session
                .report(SessionWarning::DeliveryAmbiguity(DeliveryAmbiguity {
                    recipient: entry.recipient,
                    body: entry.body,
                }));
        }
    }
}

async fn run(
    inner: Arc<RouterInner>,
    mut frames: mpsc::Receiver<String>,
    mut disconnects: watch::Receiver<u64>,
    mut expirations: mpsc::UnboundedReceiver<TypingChange>,
) {
    let mut watching_disconnects = true;
    let mut watching_expirations = true;
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(text) => inner.route(&text),
                None => break,
            },
            changed = disconnects.changed(), if watching_disconnects => match changed {
                Ok(()) => {
                    disconnects.borrow_and_update();
                    inner.fail_pending();
                }
                Err(_) => watching_disconnects = false,
            },
            // 信号触发的边沿已在 on_typing 中按帧顺序发布，这里只有过期边沿
            expired = expirations.recv(), if watching_expirations => match expired {
                Some(change) => inner.targets.bus.publish(ChatEvent::TypingChanged(change)),
                None => watching_expirations = false,
            },
        }
    }
    inner.fail_pending();
    tracing::debug!(identity = %inner.identity.id(), "路由任务结束");
}
