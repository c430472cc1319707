//! 统一配置中心
//!
//! 提供实时消息核心与中继服务的配置，包括：
//! - 连接会话（重连退避、发送队列）
//! - 输入状态 TTL
//! - 事件分发（订阅缓冲、回放长度）
//! - 服务地址与中继服务设置
//!
//! 加载顺序：默认值 -> 可选配置文件（`CHAT_CONFIG_FILE`）-> 环境变量（`CHAT_*`，层级用 `__` 分隔）。

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 全局应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    /// 连接会话配置
    #[serde(default)]
    #[validate(nested)]
    pub session: SessionConfig,
    /// 输入状态配置
    #[serde(default)]
    #[validate(nested)]
    pub typing: TypingConfig,
    /// 事件分发配置
    #[serde(default)]
    #[validate(nested)]
    pub dispatch: DispatchConfig,
    /// 远端地址
    #[serde(default)]
    #[validate(nested)]
    pub endpoints: EndpointConfig,
    /// 中继服务配置
    #[serde(default)]
    #[validate(nested)]
    pub relay: RelayConfig,
}

/// 连接会话配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SessionConfig {
    /// 单轮连接的最大尝试次数（含首次）
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    /// 指数退避基数
    #[validate(range(min = 1))]
    pub base_backoff_ms: u64,
    /// 单次退避上限
    #[validate(range(min = 1))]
    pub max_backoff_ms: u64,
    /// 出站队列深度，断线期间超出后丢弃最旧帧
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    /// 入站缓冲深度
    #[validate(range(min = 1))]
    pub inbound_capacity: usize,
    /// 关闭时发送离开通知的等待上限
    pub close_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            queue_capacity: 64,
            inbound_capacity: 256,
            close_timeout_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// 输入状态配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TypingConfig {
    /// 未收到刷新信号时自动回到 Idle 的时长
    #[validate(range(min = 1))]
    pub ttl_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self { ttl_ms: 5_000 }
    }
}

impl TypingConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// 事件分发配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatchConfig {
    /// 每个订阅者的缓冲，落后超过此值的订阅者丢弃最旧事件
    #[validate(range(min = 1))]
    pub subscriber_capacity: usize,
    /// 保留供回放的最近事件数
    pub replay_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            replay_capacity: 100,
        }
    }
}

/// 远端地址
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EndpointConfig {
    #[validate(url)]
    pub ws_url: String,
    #[validate(url)]
    pub api_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8080/ws".into(),
            api_url: "http://127.0.0.1:8080".into(),
        }
    }
}

/// 中继服务配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RelayConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    /// 每个连接的待发送帧上限，慢连接超出后丢帧
    #[validate(range(min = 1))]
    pub session_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            session_capacity: 128,
        }
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("invalid session configuration: {0}")]
    InvalidSession(String),
}

impl AppConfig {
    /// 按默认值 -> 可选文件 -> 环境变量的顺序加载并校验
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("CHAT_CONFIG_FILE") {
            fig = Self::merge_file(fig, &path);
        }
        Self::extract(fig.merge(Env::prefixed("CHAT_").split("__")))
    }

    /// 从指定文件加载（不读取环境变量），主要用于测试与工具
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let fig = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        Self::extract(Self::merge_file(fig, path))
    }

    fn merge_file(fig: Figment, path: &str) -> Figment {
        if path.ends_with(".yml") || path.ends_with(".yaml") {
            fig.merge(Yaml::file(path))
        } else if path.ends_with(".json") {
            fig.merge(Json::file(path))
        } else {
            fig.merge(Toml::file(path))
        }
    }

    fn extract(fig: Figment) -> Result<Self, ConfigError> {
        let cfg: AppConfig = fig.extract().map_err(Box::new)?;
        cfg.check()?;
        Ok(cfg)
    }

    /// 字段校验之外的组合约束
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.session.base_backoff_ms > self.session.max_backoff_ms {
            return Err(ConfigError::InvalidSession(format!(
                "base_backoff_ms ({}) must not exceed max_backoff_ms ({})",
                self.session.base_backoff_ms, self.session.max_backoff_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.session.max_attempts, 5);
        assert_eq!(config.typing.ttl(), Duration::from_secs(5));
    }

    #[test]
    fn test_env_overrides_nested_values() {
        Jail::expect_with(|jail| {
            jail.set_env("CHAT_SESSION__QUEUE_CAPACITY", "3");
            jail.set_env("CHAT_TYPING__TTL_MS", "1500");
            jail.set_env("CHAT_RELAY__PORT", "9001");

            let config = AppConfig::load().expect("load");
            assert_eq!(config.session.queue_capacity, 3);
            assert_eq!(config.typing.ttl_ms, 1500);
            assert_eq!(config.relay.port, 9001);
            // 未覆盖的字段保持默认
            assert_eq!(config.session.max_attempts, 5);
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_precedence() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "chat.yaml",
                "session:\n  max_attempts: 9\n  base_backoff_ms: 10\n  max_backoff_ms: 100\n  queue_capacity: 4\n  inbound_capacity: 8\n  close_timeout_ms: 0\n",
            )?;
            jail.set_env("CHAT_CONFIG_FILE", "chat.yaml");
            jail.set_env("CHAT_SESSION__MAX_ATTEMPTS", "2");

            let config = AppConfig::load().expect("load");
            assert_eq!(config.session.max_attempts, 2);
            assert_eq!(config.session.queue_capacity, 4);
            Ok(())
        });
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let mut config = AppConfig::default();
        config.session.queue_capacity = 0;
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_backoff_base_above_max_is_rejected() {
        let mut config = AppConfig::default();
        config.session.base_backoff_ms = 10_000;
        config.session.max_backoff_ms = 100;
        assert!(matches!(config.check(), Err(ConfigError::InvalidSession(_))));
    }

    #[test]
    fn test_bad_url_is_rejected() {
        let mut config = AppConfig::default();
        config.endpoints.ws_url = "not a url".into();
        assert!(config.check().is_err());
    }
}
