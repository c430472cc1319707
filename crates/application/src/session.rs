//! 连接会话
//!
//! 每个登录身份一条持久通道，负责：
//! - 建立连接并通告上线（失败时按退避策略重试，预算耗尽后返回 `ConnectionError`）
//! - 断线自动重连，每次重连后重新通告上线，对端的在线集合因此自愈
//! - 有界出站队列：断线期间缓存待发帧，满了丢弃最旧一帧并给出 `BackpressureWarning`
//! - 关闭时尽力通告下线，然后拆除通道
//!
//! 一个读任务把入站帧推进有界缓冲，一个写任务独占出站半边；
//! 慢消费者只会导致入站丢帧，不会阻塞传输层的读循环。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use config::SessionConfig;
use domain::IdentityId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{
    BackpressureWarning, BufferDirection, ConnectionError, SessionError, SessionWarning,
};
use crate::retry::{retry_async, RetryError, RetryPolicy};
use crate::transport::{Channel, FrameSink, FrameSource, Transport, TransportError};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// 重连预算耗尽：不再有实时更新，发送被拒绝
    Offline,
    Closed,
}

/// 会话需要代为发送的通告帧，由路由器编码
#[derive(Debug, Clone)]
pub struct Announcements {
    pub join: String,
    pub leave: String,
}

#[derive(Debug, Clone)]
struct SessionSettings {
    retry: RetryPolicy,
    queue_capacity: usize,
    inbound_capacity: usize,
    close_timeout: Duration,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            queue_capacity: config.queue_capacity.max(1),
            inbound_capacity: config.inbound_capacity.max(1),
            close_timeout: config.close_timeout(),
        }
    }
}

/// 有界出站队列，满了丢弃最旧的帧
struct OutboundQueue {
    frames: VecDeque<(u64, String)>,
    next_seq: u64,
    capacity: usize,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            next_seq: 0,
            capacity,
        }
    }

    fn push(&mut self, frame: String) -> Option<BackpressureWarning> {
        let warning = if self.frames.len() >= self.capacity {
            self.frames.pop_front();
            Some(BackpressureWarning {
                direction: BufferDirection::Outbound,
                capacity: self.capacity,
            })
        } else {
            None
        };
        self.frames.push_back((self.next_seq, frame));
        self.next_seq += 1;
        warning
    }

    fn front(&self) -> Option<(u64, String)> {
        self.frames.front().cloned()
    }

    /// 仅当队首仍是刚写出的那一帧时才出队
    fn pop_if(&mut self, seq: u64) {
        if matches!(self.frames.front(), Some((front, _)) if *front == seq) {
            self.frames.pop_front();
        }
    }
}

struct SessionShared {
    identity: IdentityId,
    settings: SessionSettings,
    outbound: Mutex<OutboundQueue>,
    wake: Notify,
    status: watch::Sender<ConnectionStatus>,
    disconnects: watch::Sender<u64>,
    warnings: broadcast::Sender<SessionWarning>,
    inbound: Mutex<Option<mpsc::Receiver<String>>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionShared {
    fn queue(&self) -> MutexGuard<'_, OutboundQueue> {
        self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn warn(&self, warning: SessionWarning) {
        let _ = self.warnings.send(warning);
    }
}

enum DriveEnd {
    Cancelled(Box<dyn FrameSink>),
    Lost(TransportError),
}

/// 连接会话句柄，可廉价克隆
#[derive(Clone)]
pub struct ConnectionSession {
    shared: Arc<SessionShared>,
}

impl ConnectionSession {
    /// 建立通道并通告上线。
    ///
    /// 挂起直到握手完成或重试预算耗尽。
    pub async fn open(
        identity: IdentityId,
        transport: Arc<dyn Transport>,
        announcements: Announcements,
        config: &SessionConfig,
    ) -> Result<Self, ConnectionError> {
        let settings = SessionSettings::from(config);
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let (disconnects, _) = watch::channel(0);
        let (warnings, _) = broadcast::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity);

        let shared = Arc::new(SessionShared {
            identity,
            outbound: Mutex::new(OutboundQueue::new(settings.queue_capacity)),
            settings,
            wake: Notify::new(),
            status,
            disconnects,
            warnings,
            inbound: Mutex::new(Some(inbound_rx)),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });

        tracing::info!(identity = %shared.identity, "建立连接会话");
        let channel = match connect_and_announce(&shared, &transport, &announcements.join, false).await
        {
            Ok(channel) => channel,
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                tracing::error!(identity = %shared.identity, attempts, error = %last_error, "无法建立连接");
                shared.set_status(ConnectionStatus::Offline);
                return Err(ConnectionError::Unavailable {
                    attempts,
                    last_error,
                });
            }
            Err(RetryError::Cancelled) => return Err(ConnectionError::Closed),
        };

        let handle = tokio::spawn(supervise(
            shared.clone(),
            transport,
            announcements,
            channel,
            inbound_tx,
        ));
        *shared
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        Ok(Self { shared })
    }

    pub fn identity(&self) -> &IdentityId {
        &self.shared.identity
    }

    /// 入队一帧，从不阻塞。
    ///
    /// 队列已满时丢弃最旧的帧并返回告警；断线期间的帧在重连后按原顺序发出。
    pub fn send(&self, frame: String) -> Result<Option<BackpressureWarning>, SessionError> {
        if self.shared.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        match *self.shared.status.borrow() {
            ConnectionStatus::Offline => return Err(SessionError::Offline),
            ConnectionStatus::Closed => return Err(SessionError::Closed),
            _ => {}
        }

        let warning = self.shared.queue().push(frame);
        if let Some(warning) = &warning {
            tracing::warn!(identity = %self.shared.identity, capacity = warning.capacity, "出站队列已满，丢弃最旧的帧");
            self.shared.warn(SessionWarning::Backpressure(warning.clone()));
        }
        self.shared.wake.notify_one();
        Ok(warning)
    }

    /// 注册唯一的入站消费者，只能调用一次
    pub fn take_inbound(&self) -> Result<mpsc::Receiver<String>, SessionError> {
        self.shared
            .inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(SessionError::InboundAlreadyTaken)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// 已发生的断线次数，每次连接丢失加一
    pub fn disconnects(&self) -> watch::Receiver<u64> {
        self.shared.disconnects.subscribe()
    }

    pub fn warnings(&self) -> broadcast::Receiver<SessionWarning> {
        self.shared.warnings.subscribe()
    }

    /// 上报一条旁路告警（例如路由器发现的送达不确定）
    pub fn report(&self, warning: SessionWarning) {
        self.shared.warn(warning);
    }

    /// 当前排队等待写出的帧数
    pub fn pending(&self) -> usize {
        self.shared.queue().frames.len()
    }

    /// 尽力通告下线并拆除通道。可重复调用。
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        let handle = self
            .shared
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "会话任务异常退出");
            }
            tracing::info!(identity = %self.shared.identity, "连接会话已关闭");
        }
        self.shared.set_status(ConnectionStatus::Closed);
    }
}

/// 连接并发送上线通告；两步任一失败都算一次失败的尝试
async fn connect_and_announce(
    shared: &Arc<SessionShared>,
    transport: &Arc<dyn Transport>,
    join: &str,
    reconnecting: bool,
) -> Result<Channel, RetryError<TransportError>> {
    retry_async(&shared.settings.retry, &shared.cancel, |attempt| {
        let transport = transport.clone();
        let join = join.to_owned();
        if reconnecting {
            shared.set_status(ConnectionStatus::Reconnecting { attempt });
        }
        async move {
            let mut channel = transport.connect().await?;
            channel.sink.send(join).await?;
            Ok(channel)
        }
    })
    .await
}

/// 会话主循环：驱动当前通道，断开后重连，直到被取消或重连预算耗尽
async fn supervise(
    shared: Arc<SessionShared>,
    transport: Arc<dyn Transport>,
    announcements: Announcements,
    first: Channel,
    inbound_tx: mpsc::Sender<String>,
) {
    let mut next = Some(first);
    loop {
        let channel = match next.take() {
            Some(channel) => channel,
            None => {
                match connect_and_announce(&shared, &transport, &announcements.join, true).await {
                    Ok(channel) => {
                        tracing::info!(identity = %shared.identity, "重连成功，已重新通告上线");
                        channel
                    }
                    Err(RetryError::Cancelled) => {
                        shared.set_status(ConnectionStatus::Closed);
                        return;
                    }
                    Err(RetryError::Exhausted {
                        attempts,
                        last_error,
                    }) => {
                        tracing::error!(
                            identity = %shared.identity,
                            attempts,
                            error = %last_error,
                            "重连失败，进入离线状态"
                        );
                        shared.set_status(ConnectionStatus::Offline);
                        return;
                    }
                }
            }
        };

        shared.set_status(ConnectionStatus::Connected);
        match drive(&shared, channel, &inbound_tx).await {
            DriveEnd::Cancelled(sink) => {
                shutdown(&shared, sink, &announcements.leave).await;
                shared.set_status(ConnectionStatus::Closed);
                return;
            }
            DriveEnd::Lost(err) => {
                tracing::warn!(identity = %shared.identity, error = %err, "连接断开，准备重连");
                shared.disconnects.send_modify(|count| *count += 1);
                shared.set_status(ConnectionStatus::Reconnecting { attempt: 0 });
            }
        }
    }
}

/// 在一条通道上运行读写，直到断开或被取消
async fn drive(
    shared: &Arc<SessionShared>,
    channel: Channel,
    inbound_tx: &mpsc::Sender<String>,
) -> DriveEnd {
    let Channel { mut sink, source } = channel;
    let (lost_tx, mut lost_rx) = oneshot::channel();
    let reader = tokio::spawn(read_loop(
        shared.clone(),
        source,
        inbound_tx.clone(),
        lost_tx,
    ));

    let end = 'drive: loop {
        loop {
            let next = shared.queue().front();
            let Some((seq, frame)) = next else {
                break;
            };
            if let Err(err) = sink.send(frame).await {
                break 'drive DriveEnd::Lost(err);
            }
            shared.queue().pop_if(seq);
        }

        tokio::select! {
            biased;
            _ = shared.wake.notified() => {}
            lost = &mut lost_rx => {
                break DriveEnd::Lost(lost.unwrap_or(TransportError::Closed));
            }
            _ = shared.cancel.cancelled() => break DriveEnd::Cancelled(sink),
        }
    };

    reader.abort();
    end
}

/// 唯一的读任务：入站缓冲满时丢弃新帧并告警，绝不阻塞读循环
async fn read_loop(
    shared: Arc<SessionShared>,
    mut source: Box<dyn FrameSource>,
    inbound_tx: mpsc::Sender<String>,
    lost_tx: oneshot::Sender<TransportError>,
) {
    while let Some(item) = source.next_frame().await {
        match item {
            Ok(frame) => match inbound_tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let warning = BackpressureWarning {
                        direction: BufferDirection::Inbound,
                        capacity: shared.settings.inbound_capacity,
                    };
                    tracing::warn!(identity = %shared.identity, "入站缓冲已满，丢弃一帧");
                    shared.warn(SessionWarning::Backpressure(warning));
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(identity = %shared.identity, "入站消费者已退出，丢弃帧");
                }
            },
            Err(err) => {
                let _ = lost_tx.send(err);
                return;
            }
        }
    }
    let _ = lost_tx.send(TransportError::Closed);
}

/// 关闭：先尽力写出剩余帧，再通告下线，最后关闭通道
async fn shutdown(shared: &Arc<SessionShared>, mut sink: Box<dyn FrameSink>, leave: &str) {
    let limit = shared.settings.close_timeout;
    let flush = async {
        loop {
            let next = shared.queue().front();
            let Some((seq, frame)) = next else {
                break;
            };
            sink.send(frame).await?;
            shared.queue().pop_if(seq);
        }
        sink.send(leave.to_owned()).await?;
        sink.close().await
    };
    match timeout(limit, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(identity = %shared.identity, error = %err, "下线通告发送失败");
        }
        Err(_) => {
            tracing::warn!(identity = %shared.identity, "下线通告超时");
        }
    }
}
