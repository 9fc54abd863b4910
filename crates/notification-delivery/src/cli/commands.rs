//! CLI 命令定义

use clap::{Parser, Subcommand};

/// 通知投递命令行工具
///
/// 使用日志传输层演练投递流程，不会真正调用外部消息平台。
#[derive(Parser, Debug)]
#[command(name = "notification-delivery")]
#[command(version, about = "通知投递引擎命令行工具")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 向指定接收方发送消息
    Send {
        /// 接收方 ID，可重复指定
        #[arg(long = "to", required = true)]
        to: Vec<String>,

        /// 消息文本
        #[arg(short, long)]
        text: String,

        /// 按 HTML 渲染
        #[arg(long)]
        html: bool,

        /// 等待所有接收方投递完成后再输出结果
        #[arg(long)]
        wait: bool,

        /// 单接收方严格模式：投递失败时以错误退出
        #[arg(long)]
        strict: bool,
    },

    /// 向某类通知的全部订阅者广播
    ///
    /// 订阅关系来自配置中的 `subscribers` 段。
    Notify {
        /// 通知类别
        #[arg(short, long)]
        class: String,

        /// 通知正文（会自动加上通知横幅）
        #[arg(short, long)]
        text: String,

        /// 按 HTML 渲染
        #[arg(long)]
        html: bool,
    },
}
