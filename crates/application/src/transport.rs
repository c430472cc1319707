//! 传输层抽象
//!
//! 会话只关心“连上、写一帧、读一帧、关闭”，具体协议（WebSocket 等）由基础设施层实现。
//! 帧在这一层是不透明的文本，结构只有路由器理解。

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("channel closed")]
    Closed,
    #[error("transport io error: {0}")]
    Io(String),
}

/// 出站半边：由会话的唯一写任务持有
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// 入站半边：由会话的唯一读任务持有。返回 `None` 表示对端关闭。
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

/// 一条已建立的双向通道
pub struct Channel {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// 建立通道的工厂，每次重连都会调用一次
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Channel, TransportError>;
}

/// 内存实现的传输层（用于测试）
///
/// `MemoryTransport` 交给会话使用，`MemoryRemote` 扮演对端：可以投递入站帧、
/// 观察会话写出的帧、切断当前连接或让后续连接失败。
pub mod memory {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    struct LiveLink {
        id: u64,
        to_client: mpsc::UnboundedSender<String>,
    }

    struct State {
        available: bool,
        connects: u32,
        next_link: u64,
        current: Option<LiveLink>,
    }

    struct Shared {
        state: Mutex<State>,
        written: mpsc::UnboundedSender<String>,
        written_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    }

    impl Shared {
        fn lock(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }

    #[derive(Clone)]
    pub struct MemoryTransport {
        shared: Arc<Shared>,
    }

    #[derive(Clone)]
    pub struct MemoryRemote {
        shared: Arc<Shared>,
    }

    impl MemoryTransport {
        pub fn new() -> (Self, MemoryRemote) {
            let (written, written_rx) = mpsc::unbounded_channel();
            let shared = Arc::new(Shared {
                state: Mutex::new(State {
                    available: true,
                    connects: 0,
                    next_link: 0,
                    current: None,
                }),
                written,
                written_rx: tokio::sync::Mutex::new(written_rx),
            });
            (
                Self {
                    shared: shared.clone(),
                },
                MemoryRemote { shared },
            )
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn connect(&self) -> Result<Channel, TransportError> {
            let mut state = self.shared.lock();
            if !state.available {
                return Err(TransportError::Connect("remote unavailable".into()));
            }
            state.connects += 1;
            state.next_link += 1;
            let id = state.next_link;
            let (to_client, from_remote) = mpsc::unbounded_channel();
            state.current = Some(LiveLink { id, to_client });

            Ok(Channel {
                sink: Box::new(MemorySink {
                    link: id,
                    shared: self.shared.clone(),
                }),
                source: Box::new(MemorySource { rx: from_remote }),
            })
        }
    }

    struct MemorySink {
        link: u64,
        shared: Arc<Shared>,
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send(&mut self, frame: String) -> Result<(), TransportError> {
            let state = self.shared.lock();
            match &state.current {
                Some(live) if live.id == self.link => self
                    .shared
                    .written
                    .send(frame)
                    .map_err(|_| TransportError::Closed),
                _ => Err(TransportError::Closed),
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            let mut state = self.shared.lock();
            if matches!(&state.current, Some(live) if live.id == self.link) {
                state.current = None;
            }
            Ok(())
        }
    }

    struct MemorySource {
        rx: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
            self.rx.recv().await.map(Ok)
        }
    }

    impl MemoryRemote {
        /// 控制后续 `connect` 是否成功
        pub fn set_available(&self, available: bool) {
            self.shared.lock().available = available;
        }

        /// 切断当前连接：会话的读端会看到对端关闭，写端返回错误
        pub fn drop_connection(&self) {
            self.shared.lock().current = None;
        }

        pub fn is_connected(&self) -> bool {
            self.shared.lock().current.is_some()
        }

        pub fn connect_count(&self) -> u32 {
            self.shared.lock().connects
        }

        /// 向当前连接投递一帧；没有连接时返回 `false`
        pub fn deliver(&self, frame: impl Into<String>) -> bool {
            let state = self.shared.lock();
            match &state.current {
                Some(live) => live.to_client.send(frame.into()).is_ok(),
                None => false,
            }
        }

        /// 等待会话写出的下一帧（跨所有连接、按写出顺序）
        pub async fn next_written(&self) -> Option<String> {
            self.shared.written_rx.lock().await.recv().await
        }

        /// 取走目前已写出的全部帧，不等待
        pub async fn drain_written(&self) -> Vec<String> {
            let mut rx = self.shared.written_rx.lock().await;
            let mut frames = Vec::new();
            while let Ok(frame) = rx.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }
}
