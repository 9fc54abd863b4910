//! 命令执行器
//!
//! 把命令行参数转化为对投递引擎的调用，并以 JSON 输出结果汇总。

use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::coordinator::{BroadcastCoordinator, BroadcastReport};
use crate::directory::SubscriberDirectory;
use crate::message::{Message, Recipient, RenderMode};
use crate::notifications::NotificationDispatcher;
use crate::outcome::DeliveryOutcome;

/// 投递结果汇总
#[derive(Debug, Serialize)]
pub struct BroadcastSummary {
    pub broadcast_id: Option<Uuid>,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub outcomes: Vec<DeliveryOutcome>,
}

impl BroadcastSummary {
    pub fn new(broadcast_id: Option<Uuid>, outcomes: Vec<DeliveryOutcome>) -> Self {
        let sent = outcomes.iter().filter(|o| o.is_sent()).count();
        Self {
            broadcast_id,
            total: outcomes.len(),
            sent,
            failed: outcomes.len() - sent,
            outcomes,
        }
    }
}

/// 命令执行器
pub struct CommandRunner {
    coordinator: BroadcastCoordinator,
    directory: Arc<dyn SubscriberDirectory>,
    notification_prefix: String,
}

impl CommandRunner {
    pub fn new(
        coordinator: BroadcastCoordinator,
        directory: Arc<dyn SubscriberDirectory>,
        notification_prefix: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            directory,
            notification_prefix: notification_prefix.into(),
        }
    }

    /// 执行 send 命令
    pub async fn run_send(
        &self,
        to: Vec<String>,
        text: String,
        html: bool,
        wait: bool,
        strict: bool,
    ) -> Result<BroadcastSummary> {
        let message = build_message(text, html);
        let recipients: Vec<Recipient> = to.into_iter().map(Recipient::from).collect();

        if strict {
            let [recipient] = <[Recipient; 1]>::try_from(recipients)
                .map_err(|_| anyhow!("--strict 只支持单个接收方"))?;
            let outcome = self.coordinator.send_or_raise(recipient, message).await?;
            return Ok(BroadcastSummary::new(None, vec![outcome]));
        }

        let report = self.coordinator.broadcast(recipients, message, wait).await?;
        summarize(report).await
    }

    /// 执行 notify 命令
    pub async fn run_notify(&self, class: &str, text: &str, html: bool) -> Result<BroadcastSummary> {
        let dispatcher = NotificationDispatcher::new(
            self.directory.clone(),
            self.coordinator.clone(),
            self.notification_prefix.clone(),
        );
        let render_mode = html.then_some(RenderMode::Html);

        match dispatcher.notify_subscribers(class, text, render_mode).await? {
            Some(report) => summarize(report).await,
            None => Ok(BroadcastSummary::new(None, Vec::new())),
        }
    }

    /// 等待工作池中的任务全部完成
    pub async fn shutdown(&self) {
        self.coordinator.pool().shutdown().await;
    }
}

fn build_message(text: String, html: bool) -> Message {
    let message = Message::new(text);
    if html {
        message.with_render_mode(RenderMode::Html)
    } else {
        message
    }
}

/// 后台广播在进程退出前仍需等待其完成
async fn summarize(report: BroadcastReport) -> Result<BroadcastSummary> {
    let broadcast_id = report.broadcast_id();
    if let BroadcastReport::Detached { recipients, .. } = &report {
        info!(broadcast_id = %broadcast_id, recipients, "广播已在后台提交");
    }
    let outcomes = report.into_outcomes().await?;
    Ok(BroadcastSummary::new(Some(broadcast_id), outcomes))
}
