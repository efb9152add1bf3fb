use std::future::Future;
use std::io;
use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

/// `stop(join = true)` 等待工作线程退出的上限。
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const WORKER_THREAD_NAME: &str = "spark-worker";

/// 构造执行基座时可能出现的错误。
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// 工作线程数为 0。
    ///
    /// - **意图（Why）**：零线程的多线程运行时无法推进任何任务，Strand 上的回调会永久挂起，
    ///   因此在构造阶段直接拒绝，而不是留到运行期表现为“静默卡死”。
    #[error("thread pool requires at least one worker thread")]
    ZeroThreads,
    /// Tokio 运行时构建失败（通常是线程创建被系统拒绝）。
    #[error("failed to build tokio runtime: {0}")]
    Build(#[source] io::Error),
}

/// 进程内的执行基座：一组工作线程共同消费任务队列。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 将“线程池 + 事件分发”显式化为一个可构造、可持有、可停止的对象，所有组件在构造时
///   接收 [`Executor`] 句柄，而非读取全局单例；
/// - 让应用外壳掌握关停顺序：先停业务，再停线程池。
///
/// ## 逻辑 (How)
/// - 内部是一个 Tokio 多线程运行时，工作线程统一命名为 `spark-worker` 便于在火焰图与
///   `top -H` 中辨认；
/// - [`ThreadPool::stop`] 根据 `join` 选择限时等待或后台关停。
///
/// ## 契约 (What)
/// - `new(n)`：`n` 必须大于 0；
/// - `with_default_threads()`：使用“可用并行度 − 1，至少 1”的默认值；
/// - `block_on`：在调用线程上驱动应用主 Future，**不可**在运行时内部调用；
/// - `stop`：消费线程池，之后所有 [`Executor`] 句柄提交的任务都不会再被执行。
///
/// ## 注意事项 (Trade-offs)
/// - 运行时在 `Drop` 时同样会关停，但会无限期等待阻塞任务；显式调用 `stop(true)` 可获得
///   有上限的等待时间。
#[derive(Debug)]
pub struct ThreadPool {
    runtime: Runtime,
    worker_threads: usize,
}

impl ThreadPool {
    /// 以指定工作线程数构建线程池。
    pub fn new(worker_threads: usize) -> Result<Self, RuntimeError> {
        if worker_threads == 0 {
            return Err(RuntimeError::ZeroThreads);
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name(WORKER_THREAD_NAME)
            .enable_io()
            .enable_time()
            .build()
            .map_err(RuntimeError::Build)?;
        debug!(worker_threads, "thread pool started");
        Ok(Self {
            runtime,
            worker_threads,
        })
    }

    /// 使用默认线程数构建线程池。
    pub fn with_default_threads() -> Result<Self, RuntimeError> {
        Self::new(default_worker_threads())
    }

    /// 实际工作线程数。
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// 返回提交任务用的句柄。
    pub fn executor(&self) -> Executor {
        Executor {
            handle: self.runtime.handle().clone(),
        }
    }

    /// 在调用线程上驱动 `future` 直至完成。
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// 停止线程池。
    ///
    /// - `join = true`：最多等待 5 秒让工作线程退出；
    /// - `join = false`：立即返回，工作线程在后台退出。
    pub fn stop(self, join: bool) {
        debug!(join, "thread pool stopping");
        if join {
            self.runtime.shutdown_timeout(SHUTDOWN_GRACE);
        } else {
            self.runtime.shutdown_background();
        }
    }
}

/// 默认工作线程数：可用并行度减一，至少为 1。
pub(crate) fn default_worker_threads() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

/// 执行基座的可克隆句柄。
///
/// 每个组件在构造时接收一个 `Executor`，并通过它提交异步任务；句柄本身不拥有线程。
#[derive(Clone, Debug)]
pub struct Executor {
    handle: Handle,
}

impl Executor {
    /// 捕获当前异步上下文所在的运行时。
    ///
    /// # Panics
    /// 与 [`Handle::current`] 相同：在运行时之外调用会 panic。
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    /// 尝试捕获当前运行时；不在运行时内时返回 `None`。
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(|handle| Self { handle })
    }

    /// 提交一个异步任务。
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// 底层 Tokio 句柄，供需要直接与 Tokio 交互的集成代码使用。
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl From<Handle> for Executor {
    fn from(handle: Handle) -> Self {
        Self { handle }
    }
}
