//! 有界工作池
//!
//! 固定数量的常驻工作者从同一个有界队列中取任务执行。
//! 队列满时 `submit` 挂起等待（背压），`try_submit` 显式返回 `QueueFull`。
//! 单个任务 panic 只会让该任务的句柄得到 `TaskAborted`，工作者继续服务。

use futures::FutureExt;
use futures::future::BoxFuture;
use notifier_shared::config::WorkerPoolConfig;
use notifier_shared::observability::metrics::record_pool_rejection;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("工作池队列已满")]
    QueueFull,

    #[error("工作池已关闭")]
    ShutDown,

    #[error("任务执行中止")]
    TaskAborted,
}

type Job = BoxFuture<'static, ()>;

/// 已提交任务的结果句柄
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| PoolError::TaskAborted))
    }
}

/// 有界工作池
///
/// 必须在 tokio 运行时内创建。由调用方创建一次后注入共享。
pub struct WorkerPool {
    name: String,
    worker_count: usize,
    queue_capacity: usize,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, worker_count: usize, queue_capacity: usize) -> Self {
        let name = name.into();
        let worker_count = worker_count.max(1);
        let queue_capacity = queue_capacity.max(1);

        let (tx, rx) = mpsc::channel::<Job>(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..worker_count)
            .map(|worker_id| {
                let rx = rx.clone();
                let pool = name.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    debug!(pool = %pool, worker_id, "工作者退出");
                })
            })
            .collect();

        info!(
            pool = %name,
            workers = worker_count,
            queue_capacity,
            "工作池已启动"
        );

        Self {
            name,
            worker_count,
            queue_capacity,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &WorkerPoolConfig) -> Self {
        Self::new(name, config.resolve_workers(), config.queue_capacity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// 队列中等待执行的任务数
    pub fn queued(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|tx| self.queue_capacity.saturating_sub(tx.capacity()))
            .unwrap_or(0)
    }

    /// 提交任务，队列满时等待
    pub async fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.sender()?;
        let (job, handle) = self.wrap(task);
        sender.send(job).await.map_err(|_| PoolError::ShutDown)?;
        Ok(handle)
    }

    /// 非阻塞提交，队列满时返回 [`PoolError::QueueFull`]
    pub fn try_submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.sender()?;
        let (job, handle) = self.wrap(task);
        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                record_pool_rejection(&self.name);
                PoolError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => PoolError::ShutDown,
        })?;
        Ok(handle)
    }

    /// 停止接收新任务，执行完队列中已有的任务后等待所有工作者退出
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(pool = %self.name, error = %e, "工作者异常退出");
            }
        }
        info!(pool = %self.name, "工作池已关闭");
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, PoolError> {
        self.sender.lock().clone().ok_or(PoolError::ShutDown)
    }

    fn wrap<F, T>(&self, task: F) -> (Job, TaskHandle<T>)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let pool = self.name.clone();
        let job = async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(value) => {
                    let _ = tx.send(value);
                }
                Err(_) => {
                    error!(pool = %pool, "任务执行时发生 panic，已隔离");
                }
            }
        }
        .boxed();
        (job, TaskHandle { rx })
    }
}
