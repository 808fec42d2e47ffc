use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};

/// 命令启动和执行的有界池。
///
/// 命令在独立任务中运行，不占用传输层的任务；
/// 信号量限制同时执行的数量。
#[derive(Clone)]
pub struct WorkQueue {
    start: Arc<Semaphore>,
    workers: Arc<Semaphore>,
}

impl WorkQueue {
    pub fn new(start_threads: usize, worker_threads: usize) -> Self {
        Self {
            start: Arc::new(Semaphore::new(start_threads.max(1))),
            workers: Arc::new(Semaphore::new(worker_threads.max(1))),
        }
    }

    /// 在启动池中解析命令
    pub async fn start<F: Future>(&self, f: F) -> F::Output {
        let _permit = self.start.acquire().await.ok();
        f.await
    }

    /// 在工作池中执行命令，span 以命令名命名
    pub async fn run<F: Future>(&self, command: &str, f: F) -> F::Output {
        let _permit = self.workers.acquire().await.ok();
        f.instrument(info_span!("command", name = %command)).await
    }

    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }
}
