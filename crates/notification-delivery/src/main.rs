//! 通知投递命令行入口
//!
//! 使用日志传输层和配置中的订阅关系演练投递流程。

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use notifier_shared::{config::AppConfig, observability};
use tracing::info;

use notification_delivery::{
    BroadcastCoordinator, InMemorySubscriberDirectory, LogTransport, MemoryOutcomeSink,
    cli::{Cli, CommandRunner, Commands},
};

const SERVICE_NAME: &str = "notification-delivery";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. 加载配置：.env → config/*.toml → NOTIFIER_ 环境变量
    let config = AppConfig::load(SERVICE_NAME)?;

    // 2. 初始化日志与指标
    let _guard = observability::init(&config.observability).await?;
    info!(
        environment = %config.environment,
        workers = config.worker_pool.resolve_workers(),
        "Configuration loaded"
    );

    // 3. 组装投递引擎
    let sink = Arc::new(MemoryOutcomeSink::new());
    let coordinator =
        BroadcastCoordinator::from_config(Arc::new(LogTransport), &config)?.with_sink(sink.clone());
    let directory = Arc::new(InMemorySubscriberDirectory::from_map(&config.subscribers));
    let runner = CommandRunner::new(
        coordinator,
        directory,
        config.delivery.notification_prefix.clone(),
    );

    // 4. 执行命令
    let summary = match cli.command {
        Commands::Send {
            to,
            text,
            html,
            wait,
            strict,
        } => runner.run_send(to, text, html, wait, strict).await,
        Commands::Notify { class, text, html } => runner.run_notify(&class, &text, html).await,
    };

    runner.shutdown().await;
    let summary = summary?;

    info!(recorded = sink.len(), "投递结果已记录");
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
