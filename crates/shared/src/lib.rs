//! 共享库
//!
//! 包含投递引擎共用的配置、错误处理、可观测性以及
//! 重试、熔断、限流等弹性组件。

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod observability;
pub mod rate_gate;
pub mod retry;
