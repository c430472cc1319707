use std::future::Future;
use std::time::Duration;

use config::SessionConfig;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// 第 `attempt` 次失败之后的等待时长（从 1 开始计数）
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                std::cmp::min(base.saturating_mul(factor), *max)
            }
        }
    }
}

/// 连接重试策略：退避序列与尝试上限都是显式、可测试的参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::exponential(config.base_backoff(), config.max_backoff()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last_error: E },
    Cancelled,
}

/// 按策略重试 `op`，每次失败后等待退避时长；`cancel` 触发时立即放弃。
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op(attempt) => result,
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                let delay = policy.backoff.delay_at(attempt);
                tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "连接失败，稍后重试");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::exponential(Duration::from_millis(100), Duration::from_millis(350)),
        }
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let backoff = policy(1).backoff;
        assert_eq!(backoff.delay_at(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_at(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_at(3), Duration::from_millis(350));
        assert_eq!(backoff.delay_at(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<u32, RetryError<String>> =
            retry_async(&policy(5), &CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("refused #{attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms 的退避
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget() {
        let result: Result<(), RetryError<&str>> =
            retry_async(&policy(3), &CancellationToken::new(), |_| async { Err("down") }).await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last_error: "down"
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let result: Result<(), RetryError<&str>> =
            retry_async(&policy(100), &cancel, |_| async { Err("down") }).await;

        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
