#![deny(unsafe_code)]
#![doc = r#"
# spark-hosting

## 设计动机（Why）
- 会话引擎本身只提供执行基座、传输与会话；进程级的装配（配置文件、日志、线程池规模、
  命令行与退出信号）集中在本 crate，业务只需实现 [`Application`]。

## 核心契约（What）
- [`HostConfig`]：TOML 配置，缺省段落回落到默认值；
- [`init_tracing`]：安装 `fmt + EnvFilter` 全局 Subscriber，`RUST_LOG` 优先；
- [`run_application`]：读配置、装日志、起线程池、调用业务、等待退出并收尾。

## 实现策略（How）
- 配置以 `serde` + `toml` 解析并做语义校验；
- 退出信号来自 Ctrl-C 或业务主动调用 [`ShutdownHandle::request`]。
"#]

mod application;
mod config;
mod logging;

pub use application::{Application, HostArgs, HostContext, Mode, ShutdownHandle, run_application};
pub use config::{
    ClientSection, ConfigError, HostConfig, RuntimeSection, ServerSection, SessionSection,
    TlsSection,
};
pub use logging::{LoggingError, init_tracing};
