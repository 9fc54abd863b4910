//! 通知投递引擎
//!
//! 把一条逻辑消息按传输层长度限制切分为有序分段，
//! 经限流、熔断、重试策略链投递给一个或多个接收方。
//! 接收方之间相互隔离，单个接收方失败不影响其他接收方的投递。

pub mod chunker;
pub mod cli;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod message;
pub mod notifications;
pub mod outcome;
pub mod policy;
pub mod pool;
pub mod transport;

pub use chunker::TextChunker;
pub use coordinator::{BroadcastCoordinator, BroadcastReport};
pub use directory::{DirectoryError, InMemorySubscriberDirectory, SubscriberDirectory};
pub use error::{DeliveryError, Result};
pub use message::{InlineButton, InlineKeyboard, Message, Recipient, RenderMode, Segment};
pub use notifications::NotificationDispatcher;
pub use outcome::{
    DeliveryOutcome, FailureKind, MemoryOutcomeSink, OutcomeSink, RecipientState, SegmentStatus,
};
pub use policy::{DeliveryPipeline, DeliveryPolicy};
pub use pool::{PoolError, WorkerPool};
pub use transport::{LogTransport, Transport, TransportError, TransportResponse};
