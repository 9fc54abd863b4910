//! 投递策略链
//!
//! 限流、熔断、重试是同一个 `attempt` 能力的三个独立实现，
//! 按显式顺序包裹在传输调用外层。每个策略只关心自己的职责，
//! 通过 `Next` 把调用交给链中的下一环，最内层是带超时的传输调用。
//!
//! 默认顺序：限流 → 熔断 → 重试 → 传输。

use async_trait::async_trait;
use notifier_shared::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use notifier_shared::config::AppConfig;
use notifier_shared::rate_gate::{RateGate, RateGateConfig};
use notifier_shared::retry::{RetryError, RetryPolicy, retry_with_policy};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::DeliveryError;
use crate::message::{Recipient, Segment};
use crate::transport::{Transport, TransportError, TransportResponse};

/// 默认单次传输超时
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// 一次分段投递的上下文
pub struct Attempt<'a> {
    pub recipient: &'a Recipient,
    pub segment: &'a Segment,
    transport_calls: AtomicU32,
}

impl<'a> Attempt<'a> {
    pub fn new(recipient: &'a Recipient, segment: &'a Segment) -> Self {
        Self {
            recipient,
            segment,
            transport_calls: AtomicU32::new(0),
        }
    }

    /// 已发生的传输调用次数（被熔断拒绝的不计）
    pub fn transport_calls(&self) -> u32 {
        self.transport_calls.load(Ordering::Relaxed)
    }
}

/// 投递策略
#[async_trait]
pub trait DeliveryPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(
        &self,
        attempt: &Attempt<'_>,
        next: Next<'_>,
    ) -> Result<TransportResponse, DeliveryError>;
}

/// 策略链中剩余的部分
#[derive(Clone, Copy)]
pub struct Next<'a> {
    policies: &'a [Arc<dyn DeliveryPolicy>],
    transport: &'a dyn Transport,
    send_timeout: Duration,
}

impl<'a> Next<'a> {
    /// 执行剩余策略链
    pub async fn run(self, attempt: &Attempt<'_>) -> Result<TransportResponse, DeliveryError> {
        match self.policies.split_first() {
            Some((policy, rest)) => {
                let next = Next {
                    policies: rest,
                    ..self
                };
                policy.attempt(attempt, next).await
            }
            None => self.call_transport(attempt).await,
        }
    }

    /// 最内层：带超时的传输调用，并把响应归类为瞬时或永久错误
    async fn call_transport(
        self,
        attempt: &Attempt<'_>,
    ) -> Result<TransportResponse, DeliveryError> {
        attempt.transport_calls.fetch_add(1, Ordering::Relaxed);

        let sent = tokio::time::timeout(
            self.send_timeout,
            self.transport.send(attempt.recipient, attempt.segment),
        )
        .await;

        match sent {
            Err(_) => Err(DeliveryError::Transient(TransportError::Timeout(
                self.send_timeout,
            ))),
            Ok(Err(e)) => Err(DeliveryError::Transient(e)),
            Ok(Ok(resp)) if resp.ok => Ok(resp),
            Ok(Ok(resp)) => Err(DeliveryError::Permanent {
                reason: resp.reason.unwrap_or_else(|| "对端拒绝投递".to_string()),
                raw_response: resp.raw_response,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// 限流策略
// ---------------------------------------------------------------------------

/// 每次进入都先从共享限流器取得名额
pub struct RateGatePolicy {
    gate: Arc<RateGate>,
}

impl RateGatePolicy {
    pub fn new(gate: Arc<RateGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl DeliveryPolicy for RateGatePolicy {
    fn name(&self) -> &'static str {
        "rate_gate"
    }

    async fn attempt(
        &self,
        attempt: &Attempt<'_>,
        next: Next<'_>,
    ) -> Result<TransportResponse, DeliveryError> {
        let waited = self.gate.acquire().await;
        if !waited.is_zero() {
            debug!(
                recipient = %attempt.recipient,
                segment = attempt.segment.index,
                waited_ms = waited.as_millis() as u64,
                "限流等待结束"
            );
        }
        next.run(attempt).await
    }
}

// ---------------------------------------------------------------------------
// 熔断策略
// ---------------------------------------------------------------------------

/// 全局熔断保护
///
/// 默认每种失败都计入熔断器，可用 [`CircuitBreakerPolicy::counting`] 收窄。
pub struct CircuitBreakerPolicy {
    breaker: Arc<CircuitBreaker>,
    counts_as_failure: fn(&DeliveryError) -> bool,
}

impl CircuitBreakerPolicy {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            counts_as_failure: |_| true,
        }
    }

    /// 指定哪些错误计入熔断失败
    pub fn counting(mut self, counts_as_failure: fn(&DeliveryError) -> bool) -> Self {
        self.counts_as_failure = counts_as_failure;
        self
    }
}

#[async_trait]
impl DeliveryPolicy for CircuitBreakerPolicy {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn attempt(
        &self,
        attempt: &Attempt<'_>,
        next: Next<'_>,
    ) -> Result<TransportResponse, DeliveryError> {
        let result = self
            .breaker
            .call_classified(|| next.run(attempt), self.counts_as_failure)
            .await;

        match result {
            Ok(resp) => Ok(resp),
            Err(CircuitBreakerError::Open { name }) => Err(DeliveryError::CircuitOpen { name }),
            Err(CircuitBreakerError::ServiceError(e)) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// 重试策略
// ---------------------------------------------------------------------------

/// 只重试瞬时错误，永久错误立即返回
///
/// 配置了限流器时，每次重试前重新取得名额，首次调用由外层限流策略放行。
pub struct RetryLayer {
    policy: RetryPolicy,
    gate: Option<Arc<RateGate>>,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, gate: None }
    }

    /// 重试调用同样受限流器约束
    pub fn regated(mut self, gate: Arc<RateGate>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl DeliveryPolicy for RetryLayer {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn attempt(
        &self,
        attempt: &Attempt<'_>,
        next: Next<'_>,
    ) -> Result<TransportResponse, DeliveryError> {
        let first_call = AtomicBool::new(true);
        let gate = self.gate.as_deref();

        let result = retry_with_policy(
            &self.policy,
            "send_segment",
            DeliveryError::is_transient,
            || {
                let first_call = &first_call;
                async move {
                    let is_retry = !first_call.swap(false, Ordering::Relaxed);
                    if let (true, Some(gate)) = (is_retry, gate) {
                        gate.acquire().await;
                    }
                    next.run(attempt).await
                }
            },
        )
        .await;

        match result {
            Ok(done) => Ok(done.value),
            Err(RetryError::Permanent { error, .. }) => Err(error),
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => Err(DeliveryError::RetryExhausted {
                attempts,
                last_reason: last_error.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// 策略管道
// ---------------------------------------------------------------------------

/// 组装好的策略链与传输层
pub struct DeliveryPipeline {
    policies: Vec<Arc<dyn DeliveryPolicy>>,
    transport: Arc<dyn Transport>,
    send_timeout: Duration,
}

impl DeliveryPipeline {
    pub fn builder(transport: Arc<dyn Transport>) -> DeliveryPipelineBuilder {
        DeliveryPipelineBuilder {
            policies: Vec::new(),
            transport,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// 默认顺序：限流 → 熔断 → 重试 → 传输
    ///
    /// 重试共用同一个限流器，每次传输调用恰好消耗一个名额。
    pub fn standard(
        transport: Arc<dyn Transport>,
        gate: Arc<RateGate>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self::builder(transport)
            .with(RateGatePolicy::new(gate.clone()))
            .with(CircuitBreakerPolicy::new(breaker))
            .with(RetryLayer::new(retry).regated(gate))
            .send_timeout(send_timeout)
            .build()
    }

    /// 按配置创建共享的限流器与熔断器并组装默认管道
    pub fn from_config(transport: Arc<dyn Transport>, config: &AppConfig) -> Self {
        let gate = Arc::new(RateGate::new(RateGateConfig::from_settings(
            "transport",
            &config.rate_limit,
        )));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
            "transport",
            &config.circuit_breaker,
        )));
        Self::standard(
            transport,
            gate,
            breaker,
            RetryPolicy::from(&config.retry),
            config.delivery.send_timeout(),
        )
    }

    pub fn policy_names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    /// 通过完整策略链投递一个分段
    pub async fn deliver(
        &self,
        attempt: &Attempt<'_>,
    ) -> Result<TransportResponse, DeliveryError> {
        let next = Next {
            policies: &self.policies,
            transport: self.transport.as_ref(),
            send_timeout: self.send_timeout,
        };
        next.run(attempt).await
    }
}

pub struct DeliveryPipelineBuilder {
    policies: Vec<Arc<dyn DeliveryPolicy>>,
    transport: Arc<dyn Transport>,
    send_timeout: Duration,
}

impl DeliveryPipelineBuilder {
    /// 追加一个策略，先追加的在外层
    pub fn with<P: DeliveryPolicy + 'static>(mut self, policy: P) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn with_arc(mut self, policy: Arc<dyn DeliveryPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn build(self) -> DeliveryPipeline {
        DeliveryPipeline {
            policies: self.policies,
            transport: self.transport,
            send_timeout: self.send_timeout,
        }
    }
}
