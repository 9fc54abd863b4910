//! 传输层抽象
//!
//! `Transport` 负责把一个分段发给一个接收方。两类失败语义不同：
//! - 返回 `Err(TransportError)`：网络或 HTTP 层异常，属于瞬时错误，可重试
//! - 返回 `Ok(resp)` 且 `resp.ok == false`：对端明确拒绝，属于永久错误

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::message::{Recipient, Segment};

/// 传输层响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    pub ok: bool,
    /// 拒绝原因（ok = false 时有值）
    pub reason: Option<String>,
    /// 对端原始响应，原样保留用于诊断
    pub raw_response: Option<serde_json::Value>,
}

impl TransportResponse {
    pub fn accepted(raw_response: Option<serde_json::Value>) -> Self {
        Self {
            ok: true,
            reason: None,
            raw_response,
        }
    }

    pub fn rejected(reason: impl Into<String>, raw_response: Option<serde_json::Value>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
            raw_response,
        }
    }
}

/// 瞬时传输错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("网络错误: {0}")]
    Network(String),

    #[error("请求超时: {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("HTTP 错误: status={status}, body={body}")]
    Http { status: u16, body: String },
}

/// 传输层接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发送一个分段到指定接收方
    async fn send(
        &self,
        recipient: &Recipient,
        segment: &Segment,
    ) -> Result<TransportResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// 日志传输（演练模式）
// ---------------------------------------------------------------------------

/// 只记录日志、不真正发送的传输实现
///
/// 用于命令行演练和本地联调，替换为真实消息接口时只需实现同一 trait。
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(
        &self,
        recipient: &Recipient,
        segment: &Segment,
    ) -> Result<TransportResponse, TransportError> {
        let message_id = Uuid::now_v7().to_string();

        info!(
            recipient = %recipient,
            segment = segment.index,
            total = segment.total,
            chars = segment.text.chars().count(),
            render_mode = ?segment.render_mode,
            has_controls = segment.controls.is_some(),
            message_id = %message_id,
            "模拟发送消息分段"
        );

        Ok(TransportResponse::accepted(Some(serde_json::json!({
            "ok": true,
            "result": { "message_id": message_id }
        }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, assemble_segments};

    #[tokio::test]
    async fn test_log_transport_accepts() {
        let segments = assemble_segments(&Message::new("hi"), vec!["hi".to_string()]);
        let resp = LogTransport
            .send(&Recipient::from("42"), &segments[0])
            .await
            .unwrap();

        assert!(resp.ok);
        assert!(resp.reason.is_none());
        assert!(resp.raw_response.is_some());
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(10)).to_string(),
            "请求超时: 10000ms"
        );
        assert_eq!(
            TransportError::Http {
                status: 502,
                body: "bad gateway".to_string()
            }
            .to_string(),
            "HTTP 错误: status=502, body=bad gateway"
        );
    }

    #[test]
    fn test_rejected_response() {
        let resp = TransportResponse::rejected("chat not found", None);
        assert!(!resp.ok);
        assert_eq!(resp.reason.as_deref(), Some("chat not found"));
    }
}
