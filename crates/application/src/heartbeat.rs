//! 心跳策略
//!
//! 探测间隔在基准值附近做 ±jitter 的随机抖动，避免大量连接的
//! ping 在同一时刻对齐。失联阈值固定为基准间隔的两倍：错过一轮
//! 探测还不算失联，错过两轮才算。

use config::HeartbeatConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatPolicy {
    base: Duration,
    jitter: Duration,
}

impl HeartbeatPolicy {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    pub fn from_config(config: &HeartbeatConfig) -> Self {
        Self::new(
            Duration::from_secs(config.base_interval_secs),
            Duration::from_millis(config.jitter_ms),
        )
    }

    /// 下一次探测的等待时长，每轮探测后重新采样
    pub fn probe_interval(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base;
        }
        let jitter_ms = self.jitter.as_millis() as i64;
        let offset = rand::rng().random_range(-jitter_ms..=jitter_ms);
        let base_ms = self.base.as_millis() as i64;
        Duration::from_millis((base_ms + offset) as u64)
    }

    /// 超过这个时长没有存活信号就判定失联
    pub fn stale_after(&self) -> Duration {
        self.base * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_interval_stays_within_jitter_band() {
        let policy = HeartbeatPolicy::new(Duration::from_secs(30), Duration::from_millis(1000));
        for _ in 0..200 {
            let interval = policy.probe_interval();
            assert!(interval >= Duration::from_millis(29_000));
            assert!(interval <= Duration::from_millis(31_000));
        }
    }

    #[test]
    fn zero_jitter_returns_base() {
        let policy = HeartbeatPolicy::new(Duration::from_secs(30), Duration::ZERO);
        assert_eq!(policy.probe_interval(), Duration::from_secs(30));
    }

    #[test]
    fn stale_threshold_is_twice_the_base() {
        let policy = HeartbeatPolicy::new(Duration::from_secs(30), Duration::from_millis(1000));
        assert_eq!(policy.stale_after(), Duration::from_secs(60));
    }
}
