//! 熔断器 (Circuit Breaker) 模块
//!
//! 实现标准的三态熔断器模式，保护对外部消息接口的调用。
//! 连续失败次数达到阈值时跳闸（Open），在恢复窗口后放行限定数量的
//! 探测请求（Half-Open），探测成功则恢复（Closed），否则重新跳闸。
//!
//! 所有状态读写都在同一把锁内完成，两个并发调用方不可能同时拿到
//! 唯一的探测名额。计时使用 `tokio::time::Instant`，测试可暂停时钟。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerSettings;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 正常放行所有请求
    Closed,
    /// 断路器跳闸，拒绝所有请求
    Open,
    /// 允许少量探测请求，成功则恢复
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// 熔断器配置
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后跳闸（默认 5）
    pub failure_threshold: u32,
    /// 跳闸后多久进入半开状态（默认 60 秒）
    pub recovery_timeout: Duration,
    /// 半开状态允许通过的探测请求数（默认 1）
    pub half_open_permits: u32,
    /// 熔断器名称，用于日志和指标区分
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_permits: 1,
            name: "default".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        Self::new(name)
            .with_failure_threshold(settings.failure_threshold)
            .with_recovery_timeout(Duration::from_secs(settings.reset_timeout_secs))
            .with_half_open_permits(settings.half_open_permits)
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_permits(mut self, permits: u32) -> Self {
        self.half_open_permits = permits.max(1);
        self
    }
}

/// 熔断器内部状态，受 Mutex 保护
struct InnerState {
    state: CircuitState,
    /// Closed→Open 转换依据
    consecutive_failures: u32,
    /// 最近一次跳闸的时间，Open→HalfOpen 计时起点
    opened_at: Option<Instant>,
    half_open_successes: u32,
    /// HalfOpen 中已放行的探测请求数
    half_open_attempts: u32,
}

/// 熔断器状态快照（用于监控和诊断）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Open 状态下距离进入半开还剩多久
    pub open_remaining_ms: Option<u64>,
}

/// 熔断器
///
/// 线程安全，可通过 Arc 在所有投递任务间共享。
/// 典型用法：
/// ```ignore
/// let cb = CircuitBreaker::new(config);
/// if cb.allow_request() {
///     match transport.send(..).await {
///         Ok(resp) => { cb.record_success(); resp }
///         Err(e)   => { cb.record_failure(); return Err(e) }
///     }
/// }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<InnerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            name = %config.name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            half_open_permits = config.half_open_permits,
            "熔断器已创建"
        );

        Self {
            config,
            inner: Arc::new(Mutex::new(InnerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_successes: 0,
                half_open_attempts: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// 获取当前有效状态（恢复窗口到期的 Open 报告为 HalfOpen）
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open && self.recovery_elapsed(&inner) {
            return CircuitState::HalfOpen;
        }
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let open_remaining_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(opened_at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_remaining_ms,
        }
    }

    /// 判断是否允许发起请求
    ///
    /// Closed：始终允许
    /// Open：恢复窗口到期则转为 HalfOpen 并占用一个探测名额
    /// HalfOpen：在探测配额内允许
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.recovery_elapsed(&inner) {
                    self.transition_to(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_attempts = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_permits {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// 记录调用成功
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_permits {
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // 跳闸前放行的迟到结果，不影响状态
            }
        }
    }

    /// 记录调用失败
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                // 迟到的失败不延长恢复窗口
            }
        }
    }

    /// 执行受熔断器保护的异步调用
    ///
    /// 熔断器跳闸时不执行 f，直接返回 [`CircuitBreakerError::Open`]。
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// 同 [`call`](Self::call)，但只有 `is_failure` 返回 true 的错误才计入失败
    ///
    /// 其余错误说明下游仍在正常应答，按成功处理。
    pub async fn call_classified<F, Fut, T, E>(
        &self,
        f: F,
        is_failure: impl Fn(&E) -> bool,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.allow_request() {
            record_circuit_breaker_rejection(&self.config.name);
            return Err(CircuitBreakerError::Open {
                name: self.config.name.clone(),
            });
        }

        let guard = CallGuard::new(self);
        match f().await {
            Ok(result) => {
                guard.success();
                Ok(result)
            }
            Err(e) => {
                if is_failure(&e) {
                    guard.failure();
                } else {
                    guard.success();
                }
                Err(CircuitBreakerError::ServiceError(e))
            }
        }
    }

    fn recovery_elapsed(&self, inner: &InnerState) -> bool {
        inner
            .opened_at
            .is_some_and(|opened_at| opened_at.elapsed() >= self.config.recovery_timeout)
    }

    /// 状态转换（在锁内调用）
    fn transition_to(&self, inner: &mut InnerState, new_state: CircuitState) {
        let old_state = inner.state;
        inner.state = new_state;

        match new_state {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                inner.half_open_attempts = 0;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
        }

        record_circuit_breaker_transition(&self.config.name, old_state, new_state);

        match new_state {
            CircuitState::Open => {
                warn!(
                    name = %self.config.name,
                    from = %old_state,
                    consecutive_failures = inner.consecutive_failures,
                    "熔断器跳闸：后续请求将被拒绝直到恢复窗口到期"
                );
            }
            CircuitState::HalfOpen => {
                info!(
                    name = %self.config.name,
                    permits = self.config.half_open_permits,
                    "熔断器进入半开状态：允许探测请求"
                );
            }
            CircuitState::Closed => {
                info!(
                    name = %self.config.name,
                    "熔断器恢复：服务已恢复正常"
                );
            }
        }
    }
}

/// 已放行调用的结果登记
///
/// 调用未走到终点（future 被丢弃或 panic）时在 drop 中按失败登记，
/// 半开探测因此总会以 Closed 或 Open 结束。
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl<'a> CallGuard<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(name = %self.breaker.config.name, "调用未完成即被放弃，按失败计入熔断器");
            self.breaker.record_failure();
        }
    }
}

/// 熔断器错误
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// 熔断器跳闸，请求被拒绝
    Open { name: String },
    /// 底层调用失败
    ServiceError(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { name } => write!(f, "熔断器 '{}' 处于跳闸状态，请求被拒绝", name),
            Self::ServiceError(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::fmt::Display + std::fmt::Debug> std::error::Error for CircuitBreakerError<E> {}

// ─── Prometheus 指标 ─────────────────────────────────────────────────

/// 记录状态转换
fn record_circuit_breaker_transition(name: &str, from: CircuitState, to: CircuitState) {
    metrics::counter!(
        "circuit_breaker_transitions_total",
        "name" => name.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);

    let state_value = match to {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    metrics::gauge!(
        "circuit_breaker_state",
        "name" => name.to_string()
    )
    .set(state_value);
}

/// 记录请求被拒绝
fn record_circuit_breaker_rejection(name: &str) {
    metrics::counter!(
        "circuit_breaker_rejections_total",
        "name" => name.to_string()
    )
    .increment(1);
}
