use std::time::Duration;

use rand::Rng;

use crate::core::error::ErrorCategory;

/// 重试策略: 指数退避加随机抖动.
/// 只有 Retry 类错误会被 worker 就地吞掉重试, 其余类别直接上抛
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryStrategy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// 第 retry_count 次失败后是否还值得再试
    pub fn should_retry(&self, category: ErrorCategory, retry_count: u32) -> bool {
        category == ErrorCategory::Retry && retry_count < self.max_retries
    }

    /// 第 retry_count 次重试前应等待的时长
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(retry_count.min(16) as i32);
        let base = self.base_delay.as_millis() as f64 * exp;
        let capped = base.min(self.max_delay.as_millis() as f64);
        // 抖动避免多个块同时醒来再同时打爆服务端
        let jitter = if self.jitter_factor > 0.0 {
            let span = capped * self.jitter_factor;
            rand::thread_rng().gen_range(-span..=span)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}
