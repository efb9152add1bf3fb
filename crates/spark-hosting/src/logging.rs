use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;

/// 日志安装错误。
#[derive(Debug, Error)]
pub enum LoggingError {
    /// 进程内已存在全局 Subscriber。
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
    /// 过滤表达式无法解析。
    #[error("invalid log filter `{filter}`: {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error(transparent)]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装进程级 `fmt + EnvFilter` Subscriber。
///
/// # 教案式说明
/// - **意图（Why）**：会话引擎各层只通过 `tracing` 宏输出事件，由宿主在启动时统一决定格式与级别；
/// - **逻辑（How）**：
///   1. 若外部已设置 Subscriber，返回 [`LoggingError::AlreadyInstalled`]；
///   2. 环境变量 `RUST_LOG` 存在且合法时优先使用，否则解析 `default_filter`；
///   3. 组装 `registry + EnvFilter + fmt` 并设置为全局默认；
/// - **契约（What）**：每个进程仅能成功调用一次。
pub fn init_tracing(default_filter: &str) -> Result<(), LoggingError> {
    if dispatcher::has_been_set() {
        return Err(LoggingError::AlreadyInstalled);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(default_filter)?)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter(default_filter: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_filter).map_err(|source| LoggingError::InvalidFilter {
        filter: default_filter.to_owned(),
        source,
    })
}
