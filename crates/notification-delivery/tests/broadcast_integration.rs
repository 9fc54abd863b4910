//! 广播端到端测试
//!
//! 使用脚本化传输层驱动完整的 切分 → 工作池 → 策略链 → 传输 流程。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use notification_delivery::policy::{CircuitBreakerPolicy, RateGatePolicy, RetryLayer};
use notification_delivery::{
    BroadcastCoordinator, BroadcastReport, DeliveryError, DeliveryPipeline, FailureKind,
    MemoryOutcomeSink, Message, Recipient, RecipientState, Segment, SegmentStatus, TextChunker,
    Transport, TransportError, TransportResponse, WorkerPool,
};
use notifier_shared::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use notifier_shared::rate_gate::{RateGate, RateGateConfig};
use notifier_shared::retry::RetryPolicy;

// ============================================================================
// 脚本化传输层
// ============================================================================

#[derive(Clone, Copy)]
enum Script {
    Accept,
    Reject,
    NetworkError,
    /// 前 n 次网络错误，之后成功
    FlakyTimes(usize),
}

/// 按接收方返回预设结果，并记录每次调用
#[derive(Default)]
struct ScriptedTransport {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<(String, usize, Instant)>>,
    per_recipient: Mutex<HashMap<String, usize>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self::default()
    }

    fn script(mut self, recipient: &str, script: Script) -> Self {
        self.scripts.insert(recipient.to_string(), script);
        self
    }

    /// 每次调用前必须先取得一个许可
    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn calls_for(&self, recipient: &str) -> Vec<usize> {
        self.calls
            .lock()
            .iter()
            .filter(|(r, _, _)| r == recipient)
            .map(|(_, index, _)| *index)
            .collect()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(_, _, at)| *at).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        recipient: &Recipient,
        segment: &Segment,
    ) -> Result<TransportResponse, TransportError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let id = recipient.as_str().to_string();
        self.calls
            .lock()
            .push((id.clone(), segment.index, Instant::now()));
        let seen = {
            let mut per_recipient = self.per_recipient.lock();
            let counter = per_recipient.entry(id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        match self.scripts.get(&id).copied().unwrap_or(Script::Accept) {
            Script::Accept => Ok(TransportResponse::accepted(Some(
                serde_json::json!({"message_id": seen}),
            ))),
            Script::Reject => Ok(TransportResponse::rejected(
                "chat not found",
                Some(serde_json::json!({"ok": false, "error_code": 400})),
            )),
            Script::NetworkError => Err(TransportError::Network("connection reset".into())),
            Script::FlakyTimes(n) if seen <= n => {
                Err(TransportError::Network("connection reset".into()))
            }
            Script::FlakyTimes(_) => Ok(TransportResponse::accepted(None)),
        }
    }
}

fn unlimited_gate() -> Arc<RateGate> {
    Arc::new(RateGate::new(RateGateConfig::new("test", 0, Duration::ZERO)))
}

fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        CircuitBreakerConfig::new("test").with_failure_threshold(threshold),
    ))
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
        jitter: false,
    }
}

fn coordinator(
    transport: Arc<ScriptedTransport>,
    pipeline: impl FnOnce(Arc<dyn Transport>) -> DeliveryPipeline,
    workers: usize,
    chunker: TextChunker,
) -> BroadcastCoordinator {
    let transport: Arc<dyn Transport> = transport;
    BroadcastCoordinator::new(
        Arc::new(pipeline(transport)),
        Arc::new(WorkerPool::new("integration", workers, 64)),
        chunker,
    )
}

fn standard(transport: Arc<dyn Transport>) -> DeliveryPipeline {
    DeliveryPipeline::standard(
        transport,
        unlimited_gate(),
        breaker(100),
        fast_retry(2),
        Duration::from_secs(5),
    )
}

fn recipients(ids: &[&str]) -> Vec<Recipient> {
    ids.iter().map(|id| Recipient::from(*id)).collect()
}

// ============================================================================
// 测试用例
// ============================================================================

#[tokio::test]
async fn test_one_failing_recipient_does_not_affect_others() {
    let transport = Arc::new(ScriptedTransport::new().script("bad", Script::Reject));
    let coordinator = coordinator(transport.clone(), standard, 4, TextChunker::default());

    let report = coordinator
        .broadcast(
            recipients(&["a", "bad", "b", "c"]),
            Message::new("deploy finished"),
            true,
        )
        .await
        .unwrap();

    let outcomes = report.outcomes().unwrap();
    assert_eq!(outcomes.len(), 4);
    let ids: Vec<&str> = outcomes.iter().map(|o| o.recipient.as_str()).collect();
    assert_eq!(ids, vec!["a", "bad", "b", "c"]);

    for outcome in outcomes {
        if outcome.recipient.as_str() == "bad" {
            let failure = outcome.failure.as_ref().unwrap();
            assert_eq!(failure.kind, FailureKind::Permanent);
            assert_eq!(
                failure.raw_response,
                Some(serde_json::json!({"ok": false, "error_code": 400}))
            );
            assert_eq!(outcome.state, RecipientState::Failed(0));
        } else {
            assert!(outcome.is_sent());
        }
    }
    // 永久错误不重试
    assert_eq!(transport.calls_for("bad").len(), 1);
}

#[tokio::test]
async fn test_segments_arrive_in_order_and_stop_after_failure() {
    let transport = Arc::new(ScriptedTransport::new());
    let coordinator = coordinator(
        transport.clone(),
        standard,
        3,
        TextChunker::new(4, 10).unwrap(),
    );

    let report = coordinator
        .broadcast(
            recipients(&["x", "y", "z"]),
            Message::new("abcdefghij"),
            true,
        )
        .await
        .unwrap();

    for outcome in report.outcomes().unwrap() {
        assert!(outcome.is_sent());
        assert_eq!(outcome.segments.len(), 3);
    }
    for id in ["x", "y", "z"] {
        assert_eq!(transport.calls_for(id), vec![0, 1, 2]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_until_success() {
    let transport = Arc::new(ScriptedTransport::new().script("flaky", Script::FlakyTimes(2)));
    let coordinator = coordinator(transport.clone(), standard, 2, TextChunker::default());

    let outcome = coordinator
        .send_or_raise(Recipient::from("flaky"), Message::new("ping"))
        .await
        .unwrap();

    assert!(outcome.is_sent());
    assert_eq!(outcome.total_attempts(), 3);
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_is_reported() {
    let transport = Arc::new(ScriptedTransport::new().script("down", Script::NetworkError));
    let coordinator = coordinator(transport.clone(), standard, 2, TextChunker::default());

    let err = coordinator
        .send_or_raise(Recipient::from("down"), Message::new("ping"))
        .await
        .unwrap_err();

    match err {
        DeliveryError::Undelivered {
            recipient, kind, ..
        } => {
            assert_eq!(recipient.as_str(), "down");
            assert_eq!(kind, FailureKind::RetryExhausted);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test]
async fn test_breaker_opens_and_fails_fast() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .script("r0", Script::NetworkError)
            .script("r1", Script::NetworkError)
            .script("r2", Script::NetworkError)
            .script("r3", Script::NetworkError)
            .script("r4", Script::NetworkError),
    );
    let shared_breaker = breaker(5);
    let pipeline_breaker = shared_breaker.clone();

    // 单工作者保证接收方按顺序处理
    let coordinator = coordinator(
        transport.clone(),
        move |t| {
            DeliveryPipeline::builder(t)
                .with(CircuitBreakerPolicy::new(pipeline_breaker))
                .build()
        },
        1,
        TextChunker::default(),
    );

    let ids: Vec<String> = (0..8).map(|i| format!("r{i}")).collect();
    let report = coordinator
        .broadcast(
            ids.iter().map(|id| Recipient::from(id.as_str())).collect(),
            Message::new("alert"),
            true,
        )
        .await
        .unwrap();

    let outcomes = report.outcomes().unwrap();
    for outcome in &outcomes[..5] {
        assert_eq!(outcome.failure.as_ref().unwrap().kind, FailureKind::Transient);
    }
    for outcome in &outcomes[5..] {
        assert_eq!(
            outcome.failure.as_ref().unwrap().kind,
            FailureKind::CircuitOpen
        );
        assert_eq!(outcome.total_attempts(), 0);
    }
    assert_eq!(transport.call_count(), 5);
    assert_eq!(shared_breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_rate_gate_spreads_calls_across_windows() {
    let transport = Arc::new(ScriptedTransport::new());
    let gate = Arc::new(RateGate::new(RateGateConfig::new(
        "test",
        15,
        Duration::from_secs(1),
    )));
    let coordinator = coordinator(
        transport.clone(),
        move |t| {
            DeliveryPipeline::builder(t)
                .with(RateGatePolicy::new(gate))
                .with(RetryLayer::new(RetryPolicy::no_retry()))
                .build()
        },
        5,
        TextChunker::default(),
    );

    let ids: Vec<String> = (0..30).map(|i| format!("user-{i}")).collect();
    let started = Instant::now();
    let report = coordinator
        .broadcast(
            ids.iter().map(|id| Recipient::from(id.as_str())).collect(),
            Message::new("hello"),
            true,
        )
        .await
        .unwrap();

    assert!(report.outcomes().unwrap().iter().all(|o| o.is_sent()));
    assert!(started.elapsed() >= Duration::from_secs(1));

    let mut times = transport.call_times();
    times.sort();
    assert_eq!(times.len(), 30);
    for (i, first) in times.iter().enumerate() {
        let in_window = times[i..]
            .iter()
            .take_while(|t| t.duration_since(*first) < Duration::from_secs(1))
            .count();
        assert!(in_window <= 15, "window starting at call {i} admitted {in_window}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_retries_share_rate_gate_budget() {
    let ids: Vec<String> = (0..30).map(|i| format!("user-{i}")).collect();
    let mut scripted = ScriptedTransport::new();
    for id in ids.iter().step_by(2) {
        scripted = scripted.script(id, Script::FlakyTimes(1));
    }
    let transport = Arc::new(scripted);
    let gate = Arc::new(RateGate::new(RateGateConfig::new(
        "test",
        15,
        Duration::from_secs(1),
    )));
    let coordinator = coordinator(
        transport.clone(),
        move |t| {
            DeliveryPipeline::standard(t, gate, breaker(100), fast_retry(2), Duration::from_secs(5))
        },
        5,
        TextChunker::default(),
    );

    let report = coordinator
        .broadcast(
            ids.iter().map(|id| Recipient::from(id.as_str())).collect(),
            Message::new("hello"),
            true,
        )
        .await
        .unwrap();
    assert!(report.outcomes().unwrap().iter().all(|o| o.is_sent()));

    // 30 次首发 + 15 次重试，全部计入同一个窗口预算
    let mut times = transport.call_times();
    times.sort();
    assert_eq!(times.len(), 45);
    for (i, first) in times.iter().enumerate() {
        let in_window = times[i..]
            .iter()
            .take_while(|t| t.duration_since(*first) < Duration::from_secs(1))
            .count();
        assert!(in_window <= 15, "window starting at call {i} admitted {in_window}");
    }
    assert!(times[44].duration_since(times[0]) >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_detached_broadcast_returns_before_delivery() {
    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::new().gated(gate.clone()));
    let sink = Arc::new(MemoryOutcomeSink::new());
    let coordinator =
        coordinator(transport.clone(), standard, 2, TextChunker::default()).with_sink(sink.clone());

    let report = coordinator
        .broadcast(recipients(&["a", "b", "c"]), Message::new("later"), false)
        .await
        .unwrap();

    assert!(matches!(
        report,
        BroadcastReport::Detached { recipients: 3, .. }
    ));
    assert_eq!(transport.call_count(), 0);
    assert!(sink.is_empty());

    gate.add_permits(3);
    let outcomes = report.into_outcomes().await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.is_sent()));

    tokio::time::timeout(Duration::from_secs(5), sink.wait_for(3))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_oversize_message_makes_no_calls() {
    let transport = Arc::new(ScriptedTransport::new());
    let coordinator = coordinator(
        transport.clone(),
        standard,
        2,
        TextChunker::new(10, 3).unwrap(),
    );

    let err = coordinator
        .broadcast(recipients(&["a", "b"]), Message::new("x".repeat(31)), true)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeliveryError::OversizeMessage {
            segments: 4,
            limit: 3
        }
    ));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_duplicate_recipients_are_delivered_per_occurrence() {
    let transport = Arc::new(ScriptedTransport::new());
    let coordinator = coordinator(transport.clone(), standard, 2, TextChunker::default());

    let outcomes = coordinator
        .broadcast(recipients(&["dup", "dup"]), Message::new("twice"), true)
        .await
        .unwrap()
        .into_outcomes()
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(transport.calls_for("dup").len(), 2);
}

#[tokio::test]
async fn test_failed_segment_skips_the_rest_for_that_recipient() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .script("bad", Script::Reject)
            .script("good", Script::Accept),
    );
    let coordinator = coordinator(
        transport.clone(),
        standard,
        2,
        TextChunker::new(3, 10).unwrap(),
    );

    let report = coordinator
        .broadcast(recipients(&["good", "bad"]), Message::new("aaabbbccc"), true)
        .await
        .unwrap();

    let outcomes = report.outcomes().unwrap();
    assert!(outcomes[0].is_sent());
    let bad = &outcomes[1];
    let statuses: Vec<SegmentStatus> = bad.segments.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            SegmentStatus::Failed,
            SegmentStatus::Skipped,
            SegmentStatus::Skipped
        ]
    );
    assert_eq!(transport.calls_for("bad"), vec![0]);
    assert_eq!(transport.calls_for("good"), vec![0, 1, 2]);
}
