//! 广播协调器
//!
//! 把一条消息投递给多个接收方：消息只切分一次，分段只读共享；
//! 每个接收方作为独立任务提交到注入的工作池，按序发送自己的分段，
//! 任一分段失败只终止该接收方的后续分段，不影响其他接收方。
//! 投递语义为至多一次，不做回滚。

use futures::future::join_all;
use notifier_shared::config::AppConfig;
use notifier_shared::observability::metrics::{
    record_broadcast, record_delivery_outcome, record_segment,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, instrument, warn};
use uuid::Uuid;

use crate::chunker::TextChunker;
use crate::error::{DeliveryError, Result};
use crate::message::{Message, Recipient, Segment};
use crate::outcome::{
    DeliveryFailure, DeliveryOutcome, OutcomeSink, RecipientState, SegmentReport, SegmentStatus,
};
use crate::policy::{Attempt, DeliveryPipeline};
use crate::pool::{PoolError, TaskHandle, WorkerPool};
use crate::transport::Transport;

/// 广播结果
#[derive(Debug)]
pub enum BroadcastReport {
    /// 阻塞模式：所有接收方均已到达终态，结果按输入顺序排列
    Completed {
        broadcast_id: Uuid,
        outcomes: Vec<DeliveryOutcome>,
    },
    /// 非阻塞模式：投递在后台进行，可选择等待 `completion`
    Detached {
        broadcast_id: Uuid,
        recipients: usize,
        completion: JoinHandle<Vec<DeliveryOutcome>>,
    },
}

impl BroadcastReport {
    pub fn broadcast_id(&self) -> Uuid {
        match self {
            Self::Completed { broadcast_id, .. } | Self::Detached { broadcast_id, .. } => {
                *broadcast_id
            }
        }
    }

    pub fn outcomes(&self) -> Option<&[DeliveryOutcome]> {
        match self {
            Self::Completed { outcomes, .. } => Some(outcomes),
            Self::Detached { .. } => None,
        }
    }

    /// 等待广播完成并取得全部结果
    pub async fn into_outcomes(self) -> Result<Vec<DeliveryOutcome>> {
        match self {
            Self::Completed { outcomes, .. } => Ok(outcomes),
            Self::Detached { completion, .. } => completion
                .await
                .map_err(|_| DeliveryError::Pool(PoolError::TaskAborted)),
        }
    }
}

/// 广播协调器
///
/// 克隆开销很小，内部共享同一套管道、工作池与结果接收器。
#[derive(Clone)]
pub struct BroadcastCoordinator {
    pipeline: Arc<DeliveryPipeline>,
    pool: Arc<WorkerPool>,
    chunker: TextChunker,
    sinks: Arc<Vec<Arc<dyn OutcomeSink>>>,
}

impl BroadcastCoordinator {
    pub fn new(pipeline: Arc<DeliveryPipeline>, pool: Arc<WorkerPool>, chunker: TextChunker) -> Self {
        Self {
            pipeline,
            pool,
            chunker,
            sinks: Arc::new(Vec::new()),
        }
    }

    /// 按配置组装默认引擎（需在 tokio 运行时内调用）
    pub fn from_config(transport: Arc<dyn Transport>, config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let chunker = TextChunker::from_config(&config.delivery)?;
        let pipeline = Arc::new(DeliveryPipeline::from_config(transport, config));
        let pool = Arc::new(WorkerPool::from_config("delivery", &config.worker_pool));
        Ok(Self::new(pipeline, pool, chunker))
    }

    /// 追加结果接收器
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        Arc::make_mut(&mut self.sinks).push(sink);
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn chunker(&self) -> &TextChunker {
        &self.chunker
    }

    /// 向多个接收方广播消息
    ///
    /// 只返回预检错误（过长、为空），单个接收方的失败体现在结果中。
    /// 接收方列表中的重复项各自投递一次。
    #[instrument(
        skip_all,
        fields(recipients = recipients.len(), wait = wait_for_completion)
    )]
    pub async fn broadcast(
        &self,
        recipients: Vec<Recipient>,
        message: Message,
        wait_for_completion: bool,
    ) -> Result<BroadcastReport> {
        let segments: Arc<[Segment]> = self.chunker.segments(&message)?.into();
        let broadcast_id = Uuid::now_v7();

        info!(
            broadcast_id = %broadcast_id,
            segments = segments.len(),
            "开始广播"
        );

        if wait_for_completion {
            record_broadcast("blocking");
            let outcomes = self.dispatch(broadcast_id, recipients, segments).await;
            return Ok(BroadcastReport::Completed {
                broadcast_id,
                outcomes,
            });
        }

        record_broadcast("detached");
        let count = recipients.len();
        let this = self.clone();
        let completion = tokio::spawn(
            async move { this.dispatch(broadcast_id, recipients, segments).await }
                .in_current_span(),
        );

        Ok(BroadcastReport::Detached {
            broadcast_id,
            recipients: count,
            completion,
        })
    }

    /// 单接收方投递，失败时返回 [`DeliveryError::Undelivered`]
    ///
    /// 在调用方任务内直接执行，不占用工作池。
    #[instrument(skip_all, fields(recipient = %recipient))]
    pub async fn send_or_raise(
        &self,
        recipient: Recipient,
        message: Message,
    ) -> Result<DeliveryOutcome> {
        let segments = self.chunker.segments(&message)?;
        let broadcast_id = Uuid::now_v7();
        self.deliver_to(broadcast_id, recipient, &segments)
            .await
            .into_result()
    }

    /// 提交每个接收方的任务并收集结果
    async fn dispatch(
        &self,
        broadcast_id: Uuid,
        recipients: Vec<Recipient>,
        segments: Arc<[Segment]>,
    ) -> Vec<DeliveryOutcome> {
        let mut pending: Vec<(Recipient, std::result::Result<TaskHandle<DeliveryOutcome>, PoolError>)> =
            Vec::with_capacity(recipients.len());

        for recipient in recipients {
            let this = self.clone();
            let task_recipient = recipient.clone();
            let task_segments = segments.clone();
            let submitted = self
                .pool
                .submit(async move {
                    this.deliver_to(broadcast_id, task_recipient, &task_segments)
                        .await
                })
                .await;
            pending.push((recipient, submitted));
        }

        let joined = join_all(pending.into_iter().map(|(recipient, submitted)| async move {
            let result = match submitted {
                Ok(handle) => handle.await,
                Err(e) => Err(e),
            };
            (recipient, result)
        }))
        .await;

        let mut outcomes = Vec::with_capacity(joined.len());
        for (recipient, result) in joined {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    let outcome = DeliveryOutcome::aborted(
                        recipient,
                        segments.len(),
                        &DeliveryError::Pool(e),
                    );
                    self.finish(broadcast_id, &outcome);
                    outcome
                }
            };
            outcomes.push(outcome);
        }

        let sent = outcomes.iter().filter(|o| o.is_sent()).count();
        info!(
            broadcast_id = %broadcast_id,
            sent,
            failed = outcomes.len() - sent,
            "广播完成"
        );

        outcomes
    }

    /// 按序发送单个接收方的全部分段
    #[instrument(skip_all, fields(broadcast_id = %broadcast_id, recipient = %recipient))]
    async fn deliver_to(
        &self,
        broadcast_id: Uuid,
        recipient: Recipient,
        segments: &[Segment],
    ) -> DeliveryOutcome {
        let started = Instant::now();
        let mut state = RecipientState::Pending;
        let mut reports = Vec::with_capacity(segments.len());
        let mut failure = None;

        for segment in segments {
            if failure.is_some() {
                reports.push(SegmentReport {
                    index: segment.index,
                    status: SegmentStatus::Skipped,
                    attempts: 0,
                });
                continue;
            }

            debug!(from = ?state, segment = segment.index, "发送分段");
            state = RecipientState::Sending(segment.index);

            let attempt = Attempt::new(&recipient, segment);
            match self.pipeline.deliver(&attempt).await {
                Ok(_) => {
                    record_segment("sent");
                    reports.push(SegmentReport {
                        index: segment.index,
                        status: SegmentStatus::Sent,
                        attempts: attempt.transport_calls(),
                    });
                }
                Err(e) => {
                    record_segment("failed");
                    warn!(
                        segment = segment.index,
                        total = segment.total,
                        code = e.code(),
                        error = %e,
                        "分段投递失败，终止该接收方的后续分段"
                    );
                    reports.push(SegmentReport {
                        index: segment.index,
                        status: SegmentStatus::Failed,
                        attempts: attempt.transport_calls(),
                    });
                    state = RecipientState::Failed(segment.index);
                    failure = Some(DeliveryFailure {
                        segment: segment.index,
                        kind: e.kind(),
                        reason: e.to_string(),
                        raw_response: e.raw_response().cloned(),
                    });
                }
            }
        }

        if failure.is_none() {
            state = RecipientState::Sent;
        }

        let outcome = DeliveryOutcome {
            recipient,
            state,
            segments: reports,
            failure,
            duration_ms: started.elapsed().as_millis() as u64,
            completed_at: chrono::Utc::now(),
        };
        self.finish(broadcast_id, &outcome);
        outcome
    }

    /// 记录终态结果：日志、指标、结果接收器
    fn finish(&self, broadcast_id: Uuid, outcome: &DeliveryOutcome) {
        match &outcome.failure {
            None => info!(
                broadcast_id = %broadcast_id,
                recipient = %outcome.recipient,
                segments = outcome.segments.len(),
                attempts = outcome.total_attempts(),
                duration_ms = outcome.duration_ms,
                "接收方投递成功"
            ),
            Some(failure) => warn!(
                broadcast_id = %broadcast_id,
                recipient = %outcome.recipient,
                segment = failure.segment,
                kind = failure.kind.as_str(),
                reason = %failure.reason,
                duration_ms = outcome.duration_ms,
                "接收方投递失败"
            ),
        }

        record_delivery_outcome(
            outcome.status_label(),
            outcome.duration_ms as f64 / 1000.0,
        );

        for sink in self.sinks.iter() {
            sink.record(broadcast_id, outcome);
        }
    }
}
