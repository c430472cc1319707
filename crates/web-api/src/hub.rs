use std::collections::HashMap;

use domain::IdentityId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// 中继上所有已通告身份的连接
///
/// 同一身份可以有多条连接（多个标签页）；最后一条断开时才算下线。
/// 投递使用 `try_send`，队列满的慢连接只会丢帧，不会拖住其他连接。
pub struct SessionHub {
    sessions: RwLock<HashMap<IdentityId, HashMap<Uuid, mpsc::Sender<String>>>>,
    capacity: usize,
}

impl SessionHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// 为新连接创建出站队列
    pub fn channel(&self) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(self.capacity)
    }

    pub async fn register(&self, id: IdentityId, connection: Uuid, tx: mpsc::Sender<String>) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(id).or_default().insert(connection, tx);
    }

    /// 注销一条连接，返回该身份是否已没有任何连接
    pub async fn unregister(&self, id: &IdentityId, connection: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(connections) = sessions.get_mut(id) else {
            return false;
        };
        connections.remove(&connection);
        if connections.is_empty() {
            sessions.remove(id);
            true
        } else {
            false
        }
    }

    /// 投递给某个身份的所有连接，返回成功投递的连接数
    pub async fn send_to(&self, id: &IdentityId, frame: &str) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|connections| {
                connections
                    .iter()
                    .filter(|(connection, tx)| deliver(id, **connection, tx, frame))
                    .count()
            })
            .unwrap_or(0)
    }

    /// 投递给所有连接，可排除一个身份
    pub async fn broadcast(&self, frame: &str, except: Option<&IdentityId>) {
        let sessions = self.sessions.read().await;
        for (id, connections) in sessions.iter() {
            if except == Some(id) {
                continue;
            }
            for (connection, tx) in connections {
                deliver(id, *connection, tx, frame);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.values().map(HashMap::len).sum()
    }
}

/// 非阻塞入队；队列满时记录并丢弃该帧
pub(crate) fn deliver(
    id: &IdentityId,
    connection: Uuid,
    tx: &mpsc::Sender<String>,
    frame: &str,
) -> bool {
    match tx.try_send(frame.to_owned()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(identity = %id, connection = %connection, "连接发送队列已满，丢弃帧");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
