use std::time::Duration;

/// 每次 backend 调用统一使用的重试策略
///
/// `max_tries` 只作用于同一模式内部；链上的 attempts 计数不受影响。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_tries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// 第 `try_num` 次失败后的等待时间（不含 jitter）：base * 2^(n-1)，封顶 max_delay
    pub fn base_backoff(&self, try_num: u32) -> Duration {
        let exp = 1u32 << try_num.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// 加 0~20% 的 jitter
    pub fn delay_for(&self, try_num: u32) -> Duration {
        let delay = self.base_backoff(try_num);
        let jitter_pct = rand::random::<u8>() as u32 % 21;
        delay + delay * jitter_pct / 100
    }
}
