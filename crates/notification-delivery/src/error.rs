//! 投递错误类型
//!
//! 区分预检错误（消息过长、为空、配置无效，在任何发送之前返回）与
//! 单个接收方的投递失败（瞬时、永久、熔断、重试耗尽），
//! 便于上层决定向用户展示什么以及是否需要人工介入。

use notifier_shared::error::NotifierError;
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::message::Recipient;
use crate::outcome::FailureKind;
use crate::pool::PoolError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    // ==================== 预检错误 ====================
    #[error("消息过长: 需要 {segments} 个分段，上限 {limit}")]
    OversizeMessage { segments: usize, limit: usize },

    #[error("消息内容为空")]
    EmptyMessage,

    #[error("投递配置无效: {0}")]
    InvalidConfiguration(String),

    // ==================== 投递错误 ====================
    #[error("瞬时传输错误: {0}")]
    Transient(#[from] TransportError),

    #[error("投递被拒绝: {reason}")]
    Permanent {
        reason: String,
        raw_response: Option<serde_json::Value>,
    },

    #[error("熔断器 '{name}' 处于跳闸状态，请求被拒绝")]
    CircuitOpen { name: String },

    #[error("重试 {attempts} 次后仍失败: {last_reason}")]
    RetryExhausted { attempts: u32, last_reason: String },

    #[error("无法投递到 {recipient}: {reason}")]
    Undelivered {
        recipient: Recipient,
        kind: FailureKind,
        reason: String,
        raw_response: Option<serde_json::Value>,
    },

    // ==================== 协作方错误 ====================
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Shared(#[from] NotifierError),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, DeliveryError>;

impl DeliveryError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::OversizeMessage { .. } => "OVERSIZE_MESSAGE",
            Self::EmptyMessage => "EMPTY_MESSAGE",
            Self::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            Self::Transient(_) => "TRANSIENT_TRANSPORT_ERROR",
            Self::Permanent { .. } => "PERMANENT_DELIVERY_ERROR",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::Undelivered { .. } => "UNDELIVERED",
            Self::Directory(_) => "DIRECTORY_ERROR",
            Self::Pool(_) => "WORKER_POOL_ERROR",
            Self::Shared(e) => e.code(),
        }
    }

    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// 是否为发送前即可判定的预检错误
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Self::OversizeMessage { .. } | Self::EmptyMessage | Self::InvalidConfiguration(_)
        )
    }

    /// 归类为单个接收方的失败类型
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::Transient,
            Self::Permanent { .. } => FailureKind::Permanent,
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::RetryExhausted { .. } => FailureKind::RetryExhausted,
            Self::Undelivered { kind, .. } => *kind,
            Self::Pool(_) => FailureKind::Aborted,
            Self::OversizeMessage { .. }
            | Self::EmptyMessage
            | Self::InvalidConfiguration(_)
            | Self::Directory(_)
            | Self::Shared(_) => FailureKind::Internal,
        }
    }

    /// 对端原始响应（仅永久拒绝时存在）
    pub fn raw_response(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Permanent { raw_response, .. } | Self::Undelivered { raw_response, .. } => {
                raw_response.as_ref()
            }
            _ => None,
        }
    }

    /// 面向交互命令用户的提示文案
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::OversizeMessage { .. } => "消息过长，无法发送",
            Self::EmptyMessage => "消息内容为空",
            _ => "消息投递失败，请稍后重试",
        }
    }
}
