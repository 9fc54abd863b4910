//! 投递结果
//!
//! 每次广播中每个接收方恰好产生一个终态结果。结果可序列化，
//! 由 `OutcomeSink` 接收后自行持久化或上报。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::message::Recipient;

/// 单个接收方的失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    CircuitOpen,
    RetryExhausted,
    /// 任务在工作池中被中止（panic 或池已关闭）
    Aborted,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::CircuitOpen => "circuit_open",
            Self::RetryExhausted => "retry_exhausted",
            Self::Aborted => "aborted",
            Self::Internal => "internal",
        }
    }
}

/// 接收方状态机：`Pending → Sending(i) → {Sent | Failed(i)}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "segment", rename_all = "snake_case")]
pub enum RecipientState {
    Pending,
    Sending(usize),
    Sent,
    Failed(usize),
}

impl RecipientState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed(_))
    }
}

/// 分段的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Sent,
    Failed,
    /// 前序分段失败，未发送
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentReport {
    pub index: usize,
    pub status: SegmentStatus,
    /// 实际发生的传输调用次数
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryFailure {
    pub segment: usize,
    pub kind: FailureKind,
    pub reason: String,
    pub raw_response: Option<serde_json::Value>,
}

/// 单个接收方的终态结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryOutcome {
    pub recipient: Recipient,
    pub state: RecipientState,
    pub segments: Vec<SegmentReport>,
    pub failure: Option<DeliveryFailure>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl DeliveryOutcome {
    pub fn is_sent(&self) -> bool {
        self.state == RecipientState::Sent
    }

    /// 所有分段的传输调用次数之和
    pub fn total_attempts(&self) -> u32 {
        self.segments.iter().map(|s| s.attempts).sum()
    }

    pub fn status_label(&self) -> &'static str {
        match &self.failure {
            None => "sent",
            Some(failure) => failure.kind.as_str(),
        }
    }

    /// 任务未能正常完成时（panic、池关闭）的兜底结果
    pub(crate) fn aborted(recipient: Recipient, segment_count: usize, error: &DeliveryError) -> Self {
        Self {
            recipient,
            state: RecipientState::Failed(0),
            segments: (0..segment_count)
                .map(|index| SegmentReport {
                    index,
                    status: SegmentStatus::Skipped,
                    attempts: 0,
                })
                .collect(),
            failure: Some(DeliveryFailure {
                segment: 0,
                kind: FailureKind::Aborted,
                reason: error.to_string(),
                raw_response: None,
            }),
            duration_ms: 0,
            completed_at: Utc::now(),
        }
    }

    /// 成功时原样返回，失败时转换为 [`DeliveryError::Undelivered`]
    pub fn into_result(self) -> Result<Self, DeliveryError> {
        match self.failure {
            None => Ok(self),
            Some(failure) => Err(DeliveryError::Undelivered {
                recipient: self.recipient,
                kind: failure.kind,
                reason: failure.reason,
                raw_response: failure.raw_response,
            }),
        }
    }
}

/// 结果接收器
pub trait OutcomeSink: Send + Sync {
    fn record(&self, broadcast_id: Uuid, outcome: &DeliveryOutcome);
}

/// 内存结果接收器，便于测试与命令行汇总
#[derive(Default)]
pub struct MemoryOutcomeSink {
    outcomes: Mutex<Vec<(Uuid, DeliveryOutcome)>>,
    notify: Notify,
}

impl MemoryOutcomeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<(Uuid, DeliveryOutcome)> {
        self.outcomes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 等待直到至少记录了 `count` 个结果
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl OutcomeSink for MemoryOutcomeSink {
    fn record(&self, broadcast_id: Uuid, outcome: &DeliveryOutcome) {
        self.outcomes.lock().push((broadcast_id, outcome.clone()));
        self.notify.notify_waiters();
    }
}
