//! WebSocket 传输层实现
//!
//! 每次 `connect` 建立一条新的 WebSocket 连接并拆成读写两半，
//! 分别交给会话的读任务和写任务。帧以文本消息传输。

use application::{Channel, FrameSink, FrameSource, Transport, TransportError};
use async_trait::async_trait;
use config::EndpointConfig;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(config.ws_url.clone())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Channel, TransportError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(url = %self.url, "WebSocket 连接已建立");

        let (sink, source) = stream.split();
        Ok(Channel {
            sink: Box::new(WsSink { inner: sink }),
            source: Box::new(WsSource { inner: source }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Close(_)) => return None,
                // ping/pong 由 tungstenite 自动处理，二进制帧不属于本协议
                Ok(_) => continue,
                Err(err) => return Some(Err(TransportError::Io(err.to_string()))),
            }
        }
    }
}
