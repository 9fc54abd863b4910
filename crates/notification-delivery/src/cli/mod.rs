//! CLI 模块
//!
//! - `send` - 向指定接收方发送消息
//! - `notify` - 向某类通知的全部订阅者广播
//!
//! # 使用示例
//!
//! ```bash
//! # 阻塞发送给两个接收方
//! notification-delivery send --to 1001 --to 1002 --text "服务已恢复" --wait
//!
//! # 按类别广播
//! notification-delivery notify --class alerts --text "磁盘使用率超过 90%"
//! ```

pub mod commands;
pub mod runner;

pub use commands::{Cli, Commands};
pub use runner::CommandRunner;
