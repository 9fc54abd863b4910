//! 订阅通知分发
//!
//! 按通知类别查找订阅者，加上通知横幅后交给协调器广播。
//! 默认不等待投递完成，调用方（如 webhook 处理）可立即返回。

use std::sync::Arc;
use tracing::{info, instrument};

use crate::coordinator::{BroadcastCoordinator, BroadcastReport};
use crate::directory::SubscriberDirectory;
use crate::error::Result;
use crate::message::{Message, RenderMode};

pub struct NotificationDispatcher {
    directory: Arc<dyn SubscriberDirectory>,
    coordinator: BroadcastCoordinator,
    prefix: String,
    wait_for_completion: bool,
}

impl NotificationDispatcher {
    pub fn new(
        directory: Arc<dyn SubscriberDirectory>,
        coordinator: BroadcastCoordinator,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            coordinator,
            prefix: prefix.into(),
            wait_for_completion: false,
        }
    }

    /// 等待所有订阅者投递完成后再返回
    pub fn blocking(mut self) -> Self {
        self.wait_for_completion = true;
        self
    }

    /// 向某类通知的全部订阅者广播
    ///
    /// 未知类别返回错误；类别存在但没有订阅者时不广播，返回 `Ok(None)`。
    #[instrument(skip(self, text, render_mode))]
    pub async fn notify_subscribers(
        &self,
        notification_class: &str,
        text: &str,
        render_mode: Option<RenderMode>,
    ) -> Result<Option<BroadcastReport>> {
        let recipients = self.directory.resolve(notification_class).await?;

        if recipients.is_empty() {
            info!("该类别没有订阅者，跳过广播");
            return Ok(None);
        }

        let mut message = Message::new(format!("{}{}", self.prefix, text));
        message.render_mode = render_mode;

        let report = self
            .coordinator
            .broadcast(recipients, message, self.wait_for_completion)
            .await?;
        Ok(Some(report))
    }
}
