use std::net::SocketAddr;
use std::sync::Arc;

use application::{DispatchDependencies, MessageDispatch};
use config::{AppConfig, RelayConfig};
use domain::{Identity, IdentityId};
use infrastructure::WebSocketTransport;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use web_api::{router, RelayState};

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: RelayState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestRelay {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// 以指定身份建立一个真实的客户端连接
    pub async fn client(&self, id: &str, name: &str) -> MessageDispatch {
        let identity = Identity::new(IdentityId::parse(id).unwrap(), name).unwrap();
        let transport = WebSocketTransport::new(self.ws_url());
        let deps = DispatchDependencies::new(Arc::new(transport));
        MessageDispatch::connect(identity, deps, &client_config())
            .await
            .expect("client connect")
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn client_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.session.max_attempts = 3;
    config.session.base_backoff_ms = 20;
    config.session.max_backoff_ms = 200;
    config.session.close_timeout_ms = 500;
    config
}

pub async fn spawn_relay() -> TestRelay {
    let state = RelayState::new(&RelayConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = oneshot::channel();

    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
            .expect("serve");
    });

    TestRelay {
        addr,
        state,
        shutdown: Some(tx),
    }
}
