use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use spark_runtime::{Executor, ThreadPool};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::HostConfig;
use crate::logging;

/// 宿主运行模式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// 监听并为每个入站连接创建会话。
    #[default]
    Server,
    /// 经 `Client` 主动建立一条会话。
    Client,
}

/// 宿主命令行参数。
#[derive(Clone, Debug, Parser)]
#[command(version, about = "spark session engine host")]
pub struct HostArgs {
    /// TOML 配置文件；缺省时全部使用默认值。
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// 运行模式。
    #[arg(short, long, value_enum, default_value_t = Mode::Server)]
    pub mode: Mode,
    /// 客户端模式发送的消息。
    #[arg(long, default_value = "hello")]
    pub message: String,
}

/// 请求宿主退出的可克隆句柄。
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    /// 请求退出；在宿主开始等待之前调用同样有效。
    pub fn request(&self) {
        self.notify.notify_one();
    }

    async fn requested(&self) {
        self.notify.notified().await;
    }
}

/// 交给 [`Application`] 的宿主上下文。
#[derive(Debug)]
pub struct HostContext {
    executor: Executor,
    config: Arc<HostConfig>,
    args: HostArgs,
    shutdown: ShutdownHandle,
}

impl HostContext {
    pub fn new(executor: Executor, config: HostConfig, args: HostArgs) -> Self {
        Self {
            executor,
            config: Arc::new(config),
            args,
            shutdown: ShutdownHandle::default(),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn config(&self) -> &Arc<HostConfig> {
        &self.config
    }

    pub fn args(&self) -> &HostArgs {
        &self.args
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// 在线程池上执行一个同步闭包。
    pub fn post<F>(&self, task: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.executor.spawn(async move { task() })
    }

    /// 在线程池上执行一个异步任务。
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.executor.spawn(future)
    }
}

/// 由宿主驱动的业务逻辑。
pub trait Application {
    /// 在线程池上下文内调用；返回错误时宿主不再等待退出信号。
    fn start(&mut self, ctx: &HostContext) -> anyhow::Result<()>;

    /// 退出前调用，释放会话与后台任务。
    fn stop(&mut self);
}

/// 宿主主流程。
///
/// # 教案式说明
/// - **意图（Why）**：把“读配置 → 装日志 → 起线程池 → 跑业务 → 等退出 → 收尾”的固定流程
///   收拢到一处，二进制入口只需提供 [`Application`] 实现；
/// - **逻辑（How）**：
///   1. 加载 `--config` 指定的配置，缺省时使用默认值；
///   2. 以 `runtime.log_filter` 安装全局日志，`RUST_LOG` 优先；
///   3. 按 `runtime.worker_threads` 构建线程池（缺省为并行度减一）；
///   4. 在线程池内调用 `start`，随后等待 Ctrl-C 或 [`ShutdownHandle::request`]；
///   5. 调用 `stop`，再等待线程池退出；
/// - **契约（What）**：`start` 失败时仍会调用 `stop` 并停止线程池，随后返回该错误。
pub fn run_application<A: Application>(args: HostArgs, mut app: A) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HostConfig::default(),
    };
    logging::init_tracing(&config.runtime.log_filter).context("installing logging")?;

    let pool = match config.runtime.worker_threads {
        Some(threads) => ThreadPool::new(threads)?,
        None => ThreadPool::with_default_threads()?,
    };
    info!(
        worker_threads = pool.worker_threads(),
        mode = ?args.mode,
        "host starting"
    );

    let ctx = HostContext::new(pool.executor(), config, args);
    let result = pool.block_on(async {
        app.start(&ctx)?;
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(%err, "ctrl-c listener failed");
                }
                info!("interrupt received");
            }
            _ = ctx.shutdown.requested() => info!("shutdown requested"),
        }
        anyhow::Ok(())
    });

    app.stop();
    pool.stop(true);
    info!("host stopped");
    result
}
