//! 滑动窗口限流器
//!
//! 在任意长度为 `window` 的滑动窗口内最多放行 `max_calls` 次调用，
//! 由所有并发任务共享。超出容量的调用方被挂起直到窗口腾出名额，
//! 不会被拒绝或丢弃。`max_calls = 0` 表示不限流。

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::observability::metrics::record_rate_gate_wait;

/// 限流器配置
#[derive(Debug, Clone)]
pub struct RateGateConfig {
    pub max_calls: u32,
    pub window: Duration,
    /// 用于日志和指标区分
    pub name: String,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            max_calls: 15,
            window: Duration::from_secs(1),
            name: "default".to_string(),
        }
    }
}

impl RateGateConfig {
    pub fn new(name: impl Into<String>, max_calls: u32, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            name: name.into(),
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &RateLimitConfig) -> Self {
        Self::new(name, settings.max_calls, settings.window())
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_calls == 0 || self.window.is_zero()
    }
}

/// 限流器快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateGateSnapshot {
    pub max_calls: u32,
    pub window_ms: u64,
    /// 当前窗口内已放行的调用数
    pub in_window: usize,
}

/// 进程级共享限流器
///
/// 记录窗口内每次放行的时间点。等待时长在锁内计算，
/// 睡眠在锁外进行，挂起的任务不会阻塞其他任务。
#[derive(Debug)]
pub struct RateGate {
    config: RateGateConfig,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateGate {
    pub fn new(config: RateGateConfig) -> Self {
        let capacity = config.max_calls as usize;
        Self {
            config,
            admitted: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn config(&self) -> &RateGateConfig {
        &self.config
    }

    /// 等待直到获得一个名额，返回实际等待的时长
    pub async fn acquire(&self) -> Duration {
        if self.config.is_unlimited() {
            return Duration::ZERO;
        }

        let started = Instant::now();
        loop {
            let wait = match self.admit_or_wait(Instant::now()) {
                None => break,
                Some(wait) => wait,
            };
            debug!(
                gate = %self.config.name,
                wait_ms = wait.as_millis() as u64,
                "限流窗口已满，等待名额"
            );
            tokio::time::sleep(wait).await;
        }

        let waited = started.elapsed();
        record_rate_gate_wait(&self.config.name, waited.as_secs_f64());
        waited
    }

    /// 非阻塞获取名额
    pub fn try_acquire(&self) -> bool {
        self.config.is_unlimited() || self.admit_or_wait(Instant::now()).is_none()
    }

    pub fn snapshot(&self) -> RateGateSnapshot {
        let mut admitted = self.admitted.lock();
        self.prune(&mut admitted, Instant::now());
        RateGateSnapshot {
            max_calls: self.config.max_calls,
            window_ms: self.config.window.as_millis() as u64,
            in_window: admitted.len(),
        }
    }

    /// 有名额则登记并返回 None，否则返回需要等待的时长
    fn admit_or_wait(&self, now: Instant) -> Option<Duration> {
        let mut admitted = self.admitted.lock();
        self.prune(&mut admitted, now);

        if admitted.len() < self.config.max_calls as usize {
            admitted.push_back(now);
            return None;
        }

        let oldest = admitted.front().copied().unwrap_or(now);
        // 窗口过大导致时间点溢出时，最早的名额视为永不过期
        let wait = match oldest.checked_add(self.config.window) {
            Some(expires_at) => expires_at.saturating_duration_since(now),
            None => self.config.window,
        };
        Some(wait.max(Duration::from_millis(1)))
    }

    fn prune(&self, admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = admitted.front() {
            match front.checked_add(self.config.window) {
                Some(expires_at) if expires_at <= now => {
                    admitted.pop_front();
                }
                _ => break,
            }
        }
    }
}
