//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。
//! 未安装 recorder 时所有记录函数都是空操作。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_delivery_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册投递相关指标的描述
fn register_delivery_metrics(service_name: &str) {
    metrics::describe_counter!(
        "delivery_segments_total",
        "Total number of segment delivery attempts by final status"
    );
    metrics::describe_counter!(
        "delivery_outcomes_total",
        "Total number of per-recipient delivery outcomes"
    );
    metrics::describe_histogram!(
        "delivery_duration_seconds",
        "Per-recipient delivery duration in seconds"
    );
    metrics::describe_counter!("broadcasts_total", "Total number of broadcasts started");
    metrics::describe_histogram!(
        "rate_gate_wait_seconds",
        "Time spent waiting for a rate gate admission"
    );
    metrics::describe_counter!(
        "retry_attempts_total",
        "Retry executor events by operation and result"
    );
    metrics::describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    metrics::describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half_open, 2=open)"
    );
    metrics::describe_counter!(
        "circuit_breaker_rejections_total",
        "Calls rejected by an open circuit breaker"
    );
    metrics::describe_counter!(
        "worker_pool_rejections_total",
        "Jobs rejected because the worker pool queue was full"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录单个分段的最终状态
#[inline]
pub fn record_segment(status: &str) {
    metrics::counter!(
        "delivery_segments_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录单个接收方的投递结果
#[inline]
pub fn record_delivery_outcome(status: &str, duration_secs: f64) {
    metrics::counter!(
        "delivery_outcomes_total",
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "delivery_duration_seconds",
        "status" => status.to_string()
    )
    .record(duration_secs);
}

/// 记录一次广播
#[inline]
pub fn record_broadcast(mode: &str) {
    metrics::counter!(
        "broadcasts_total",
        "mode" => mode.to_string()
    )
    .increment(1);
}

/// 记录限流等待时长
#[inline]
pub fn record_rate_gate_wait(gate: &str, wait_secs: f64) {
    metrics::histogram!(
        "rate_gate_wait_seconds",
        "gate" => gate.to_string()
    )
    .record(wait_secs);
}

/// 记录重试执行器事件（retry / recovered / permanent / exhausted）
#[inline]
pub fn record_retry_attempt(operation: &str, result: &str) {
    metrics::counter!(
        "retry_attempts_total",
        "operation" => operation.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// 记录工作池拒绝
#[inline]
pub fn record_pool_rejection(pool: &str) {
    metrics::counter!(
        "worker_pool_rejections_total",
        "pool" => pool.to_string()
    )
    .increment(1);
}
