use application::{ClientFrame, ServerFrame, TypingFrame};
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{ConversationKey, Identity, IdentityId, Message, MessageBody, Timestamp};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RelayError;
use crate::hub::deliver;
use crate::state::RelayState;

/// 中继上的单条 WebSocket 连接
///
/// 连接建立后等待客户端的上线通告；之后按帧类型转发：
/// - 公共消息广播给所有连接（包括发送方，作为回显）
/// - 私聊投递给双方，并给接收方一条新消息通知
/// - 带会话键的输入状态只发给对方，不带的发给其他所有人
///
/// 下线通告或连接断开时注销；身份的最后一条连接断开才标记下线。
pub struct RelayConnection {
    id: Uuid,
    state: RelayState,
    identity: Option<Identity>,
}

impl RelayConnection {
    pub fn new(state: RelayState) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            identity: None,
        }
    }

    /// 运行连接主循环，直到任一方向结束
    pub async fn run(mut self, socket: WebSocket) {
        let (mut sender, mut incoming) = socket.split();
        let (frame_tx, mut frame_rx) = self.state.hub.channel();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        tracing::info!(connection = %self.id, "WebSocket 连接已建立");

        // 发送任务：唯一持有 sender 的写端
        let mut send_task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        WsCommand::SendPong(data) => WsMessage::Pong(data),
                    },
                    Some(frame) = frame_rx.recv() => WsMessage::Text(frame.into()),
                    else => break,
                };
                if sender.send(message).await.is_err() {
                    tracing::warn!("WebSocket 写入失败");
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                message = incoming.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(text.as_str(), &frame_tx).await,
                    Some(Ok(WsMessage::Ping(data))) => {
                        if cmd_tx.send(WsCommand::SendPong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(connection = %self.id, error = %err, "WebSocket 读取失败");
                        break;
                    }
                },
                _ = &mut send_task => break,
            }
        }

        self.depart().await;
        send_task.abort();
        tracing::info!(connection = %self.id, "WebSocket 连接已断开");
    }

    async fn handle_text(&mut self, text: &str, frame_tx: &mpsc::Sender<String>) {
        let frame = match ClientFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(connection = %self.id, error = %err, "无法解析的客户端帧");
                return;
            }
        };

        let result = match frame {
            ClientFrame::Join { identity } => self.join(identity, frame_tx).await,
            ClientFrame::Leave { identity_id } => self.leave(&identity_id).await,
            ClientFrame::Public {
                sender_id, body, ..
            } => self.relay_public(&sender_id, body).await,
            ClientFrame::Private {
                sender_id,
                receiver_id,
                body,
                created_at,
            } => {
                self.relay_private(&sender_id, &receiver_id, body, created_at)
                    .await
            }
            ClientFrame::Typing(typing) => self.relay_typing(typing).await,
        };

        if let Err(err) = result {
            tracing::warn!(connection = %self.id, error = %err, "客户端帧被拒绝");
        }
    }

    fn joined(&self, claimed: &IdentityId) -> Result<&Identity, RelayError> {
        let identity = self.identity.as_ref().ok_or(RelayError::NotJoined)?;
        if identity.id() != claimed {
            return Err(RelayError::IdentityMismatch {
                joined: identity.id().to_string(),
                claimed: claimed.to_string(),
            });
        }
        Ok(identity)
    }

    async fn join(
        &mut self,
        identity: Identity,
        frame_tx: &mpsc::Sender<String>,
    ) -> Result<(), RelayError> {
        if matches!(&self.identity, Some(current) if current.id() != identity.id()) {
            self.depart().await;
        }

        self.state
            .hub
            .register(identity.id().clone(), self.id, frame_tx.clone())
            .await;
        tracing::info!(connection = %self.id, identity = %identity.id(), "客户端通告上线");
        let id = identity.id().clone();
        self.identity = Some(identity.clone());
        self.state.presence.mark_connected(identity);

        // 重复上线不会改变集合，因此单独给新连接补发一次快照
        let connected = self.state.presence.snapshot().iter().cloned().collect();
        let snapshot = ServerFrame::Presence { connected }.encode()?;
        deliver(&id, self.id, frame_tx, &snapshot);
        Ok(())
    }

    async fn leave(&mut self, identity_id: &IdentityId) -> Result<(), RelayError> {
        self.joined(identity_id)?;
        self.depart().await;
        Ok(())
    }

    async fn depart(&mut self) {
        let Some(identity) = self.identity.take() else {
            return;
        };
        if self.state.hub.unregister(identity.id(), self.id).await {
            self.state.presence.mark_disconnected(identity.id());
        }
    }

    async fn relay_public(
        &self,
        sender_id: &IdentityId,
        body: MessageBody,
    ) -> Result<(), RelayError> {
        let sender = self.joined(sender_id)?.clone();
        let message = Message::public(sender, body, self.state.clock.now());
        let frame = ServerFrame::from_message(&message).encode()?;
        self.state.hub.broadcast(&frame, None).await;
        Ok(())
    }

    async fn relay_private(
        &self,
        sender_id: &IdentityId,
        receiver_id: &IdentityId,
        body: MessageBody,
        created_at: Timestamp,
    ) -> Result<(), RelayError> {
        let sender = self.joined(sender_id)?.clone();
        let receiver = self.lookup(receiver_id)?;
        let notice = ServerFrame::Notification {
            message: format!("new private message from {}", sender.display_name()),
        }
        .encode()?;
        let message = Message::private(sender, receiver, body, created_at);
        let frame = ServerFrame::from_message(&message).encode()?;

        let hub = &self.state.hub;
        let delivered = hub.send_to(receiver_id, &frame).await;
        if sender_id != receiver_id {
            hub.send_to(sender_id, &frame).await;
        }
        if delivered == 0 {
            tracing::debug!(receiver = %receiver_id, "私聊接收方不在线");
        } else {
            hub.send_to(receiver_id, &notice).await;
        }
        Ok(())
    }

    async fn relay_typing(&self, typing: TypingFrame) -> Result<(), RelayError> {
        let claimed = typing.sender()?;
        let sender = self.joined(&claimed)?;
        let peer = match &typing.conversation_key {
            Some(key) => Some(peer_of(key, sender.id())?.clone()),
            None => None,
        };
        let frame = ServerFrame::Typing(TypingFrame {
            sender_id: Some(sender.id().clone()),
            sender_name: sender.display_name().to_owned(),
            ..typing
        })
        .encode()?;

        match peer {
            Some(peer) => {
                self.state.hub.send_to(&peer, &frame).await;
            }
            None => self.state.hub.broadcast(&frame, Some(sender.id())).await,
        }
        Ok(())
    }

    /// 在线集合里查显示名；不在线的接收方以 id 作为显示名
    fn lookup(&self, id: &IdentityId) -> Result<Identity, RelayError> {
        let snapshot = self.state.presence.snapshot();
        let found = match snapshot.iter().find(|identity| identity.id() == id) {
            Some(identity) => Ok(identity.clone()),
            None => Ok(Identity::new(id.clone(), id.as_str())?),
        };
        found
    }
}

fn peer_of<'a>(key: &'a ConversationKey, me: &IdentityId) -> Result<&'a IdentityId, RelayError> {
    Ok(key.other(me)?)
}

/// WebSocket 写操作命令；普通帧走连接的出站队列
#[derive(Debug)]
enum WsCommand {
    SendPong(Bytes),
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        tracing::debug!(connection = %self.id, "RelayConnection 被销毁");
    }
}
