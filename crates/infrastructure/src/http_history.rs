//! 通过 HTTP 接口读取历史消息与用户名册
//!
//! 接口沿用现有后端：
//! - `GET  /api/messages`：公共聊天室历史
//! - `GET  /api/privateMessages/private/{a}/{b}`：私聊历史，返回 `{messages, count}`
//! - `GET  /api/users`：用户名册
//! - `POST /api/messages`：写入消息
//!
//! 后端返回的记录使用旧字段名（`_id`、`user`、`text`/`content`、`username`），在这里统一转换为领域模型。

use application::{ChatHistory, HistoryError};
use async_trait::async_trait;
use config::EndpointConfig;
use domain::{ConversationKey, Identity, Message, MessageBody, MessageId, Timestamp};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRecord {
    #[serde(default, alias = "_id")]
    id: Option<MessageId>,
    #[serde(alias = "user")]
    sender: Identity,
    #[serde(default, alias = "recipient")]
    receiver: Option<Identity>,
    #[serde(alias = "text", alias = "content")]
    body: MessageBody,
    created_at: Timestamp,
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Message {
            id: record.id,
            sender: record.sender,
            recipient: record.receiver,
            body: record.body,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PrivateHistory {
    messages: Vec<MessageRecord>,
}

/// 写入请求沿用后端的字段名
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistRequest<'a> {
    user_id: &'a str,
    username: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    receiver_id: Option<&'a str>,
    created_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct HttpChatHistory {
    client: Client,
    base_url: String,
}

impl HttpChatHistory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { client, base_url }
    }

    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(config.api_url.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, HistoryError> {
        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Status(status.as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|err| HistoryError::Request(err.to_string()))?;
        serde_json::from_str(&body).map_err(|err| HistoryError::Decode(err.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, HistoryError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|err| HistoryError::Request(err.to_string()))?;
        Self::decode(response).await
    }
}

#[async_trait]
impl ChatHistory for HttpChatHistory {
    async fn fetch_history(
        &self,
        conversation: Option<ConversationKey>,
    ) -> Result<Vec<Message>, HistoryError> {
        let messages = match conversation {
            None => self.get::<Vec<MessageRecord>>("/api/messages").await?,
            Some(key) => {
                let (a, b) = key.participants();
                let path = format!("/api/privateMessages/private/{a}/{b}");
                self.get::<PrivateHistory>(&path).await?.messages
            }
        };
        debug!(count = messages.len(), "已获取历史消息");
        Ok(messages.into_iter().map(Message::from).collect())
    }

    async fn fetch_identities(&self) -> Result<Vec<Identity>, HistoryError> {
        self.get("/api/users").await
    }

    async fn persist(&self, message: Message) -> Result<Message, HistoryError> {
        let request = PersistRequest {
            user_id: message.sender.id().as_str(),
            username: message.sender.display_name(),
            content: message.body.as_str(),
            receiver_id: message.recipient.as_ref().map(|r| r.id().as_str()),
            created_at: message.created_at,
        };
        let response = self
            .client
            .post(self.url("/api/messages"))
            .json(&request)
            .send()
            .await
            .map_err(|err| HistoryError::Request(err.to_string()))?;
        let stored: MessageRecord = Self::decode(response).await?;
        Ok(stored.into())
    }
}
