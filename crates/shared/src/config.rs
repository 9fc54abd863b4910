//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{NotifierError, Result};
use crate::observability::ObservabilityConfig;

/// 无法探测 CPU 数量时使用的工作线程数
pub const FALLBACK_WORKERS: usize = 5;

/// 投递配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// 单个分段的最大字符数（按 Unicode 标量计）
    pub max_segment_len: usize,
    /// 单条消息允许切分出的最大分段数
    pub max_segments: usize,
    /// 单次传输调用的超时时间
    pub send_timeout_ms: u64,
    /// 订阅通知的前缀横幅
    pub notification_prefix: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_segment_len: 4096,
            max_segments: 50,
            send_timeout_ms: 10_000,
            notification_prefix: "🔔 新通知。\n\n".to_string(),
        }
    }
}

impl DeliveryConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// 限流配置
///
/// `max_calls = 0` 表示不限流。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 15,
            window_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// 熔断器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub half_open_permits: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
            half_open_permits: 1,
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// 工作池配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// 显式指定的工作者数量（`derive_from_cpu = false` 时生效）
    pub workers: usize,
    /// 是否按 CPU 数量推导工作者数量
    pub derive_from_cpu: bool,
    /// 覆盖探测到的 CPU 数量
    pub cpu_limit: Option<usize>,
    pub scaling_factor: f64,
    /// 工作者数量上限
    pub hard_cap: usize,
    /// 等待队列容量，满时 submit 阻塞
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: FALLBACK_WORKERS,
            derive_from_cpu: false,
            cpu_limit: None,
            scaling_factor: 1.0,
            hard_cap: 15,
            queue_capacity: 1024,
        }
    }
}

impl WorkerPoolConfig {
    /// 计算最终的工作者数量，结果落在 `[1, hard_cap]`
    ///
    /// 按 CPU 推导时：`cpu_limit`（或探测值）× `scaling_factor`。
    /// 探测失败或系数非法时回退到 [`FALLBACK_WORKERS`] 并记录告警。
    pub fn resolve_workers(&self) -> usize {
        let hard_cap = self.hard_cap.max(1);

        if !self.derive_from_cpu {
            return self.workers.clamp(1, hard_cap);
        }

        if !self.scaling_factor.is_finite() || self.scaling_factor <= 0.0 {
            warn!(
                scaling_factor = self.scaling_factor,
                fallback = FALLBACK_WORKERS,
                "扩展系数非法，使用默认工作者数量"
            );
            return FALLBACK_WORKERS.min(hard_cap);
        }

        let cpus = match self.cpu_limit {
            Some(limit) => Some(limit),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .map_err(|e| warn!(error = %e, "无法探测 CPU 数量"))
                .ok(),
        };

        match cpus {
            Some(cpus) => {
                let scaled = (cpus as f64 * self.scaling_factor).floor() as usize;
                scaled.clamp(1, hard_cap)
            }
            None => {
                warn!(fallback = FALLBACK_WORKERS, "使用默认工作者数量");
                FALLBACK_WORKERS.min(hard_cap)
            }
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub delivery: DeliveryConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub worker_pool: WorkerPoolConfig,
    pub observability: ObservabilityConfig,
    /// 通知类别 → 订阅者列表（供内存目录使用）
    pub subscribers: HashMap<String, Vec<String>>,
}

impl AppConfig {
    /// 从 .env、配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env 文件（`ENV_PATH` 可指定路径）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. config/{service_name}.toml（服务特定配置）
    /// 5. 环境变量（NOTIFIER_ 前缀，`__` 分隔层级，如
    ///    NOTIFIER_RATE_LIMIT__MAX_CALLS -> rate_limit.max_calls）
    pub fn load(service_name: &str) -> Result<Self> {
        load_env_file()?;

        let env = std::env::var("NOTIFIER_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("NOTIFIER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.observability.service_name = config.service_name.clone();
        config.validate()?;

        Ok(config)
    }

    /// 校验会导致投递引擎无法工作的配置
    pub fn validate(&self) -> Result<()> {
        if self.delivery.max_segment_len == 0 {
            return Err(NotifierError::invalid_argument(
                "delivery.max_segment_len",
                "必须大于 0",
            ));
        }
        if self.delivery.max_segments == 0 {
            return Err(NotifierError::invalid_argument(
                "delivery.max_segments",
                "必须大于 0",
            ));
        }
        if self.delivery.send_timeout_ms == 0 {
            return Err(NotifierError::invalid_argument(
                "delivery.send_timeout_ms",
                "必须大于 0",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(NotifierError::invalid_argument(
                "retry.max_attempts",
                "至少需要 1 次尝试",
            ));
        }
        if !self.worker_pool.derive_from_cpu && self.worker_pool.workers == 0 {
            return Err(NotifierError::invalid_argument(
                "worker_pool.workers",
                "必须大于 0",
            ));
        }
        if self.worker_pool.queue_capacity == 0 {
            return Err(NotifierError::invalid_argument(
                "worker_pool.queue_capacity",
                "必须大于 0",
            ));
        }
        Ok(())
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// 加载 .env 文件，文件不存在时静默跳过
fn load_env_file() -> Result<()> {
    let loaded = match std::env::var("ENV_PATH") {
        Ok(path) => dotenvy::from_path(path).map(|_| ()),
        Err(_) => dotenvy::dotenv().map(|_| ()),
    };

    match loaded {
        Ok(()) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
