use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use spark_transport_tcp::TcpSocketConfig;
use thiserror::Error;

/// 配置加载错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件不可读。
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// TOML 语法或字段类型错误。
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// 字段取值不合法。
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 宿主配置文件。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把线程池规模、日志过滤、会话超时、套接字选项与 TLS 材料集中在一个 TOML 文件里，
///   应用外壳据此装配执行基座与会话；
///
/// ## 逻辑 (How)
/// - 各段都带默认值，缺省的段与字段回落到默认；未知字段直接报错，避免拼写错误被静默忽略；
/// - `validate` 做语义校验，`load` 在解析后自动调用。
///
/// ## 契约 (What)
/// ```toml
/// [runtime]
/// worker_threads = 4          # 缺省：可用并行度 - 1，至少 1
/// log_filter = "info"
///
/// [session]
/// receive_timeout_secs = 30   # 0 表示关闭接收超时
/// connect_timeout_secs = 10
/// nodelay = true
/// keepalive = false
/// linger_secs = 5             # 可选
///
/// [tls]                       # 可选
/// verify_host = "localhost"
/// keys_path = "/etc/spark/keys"
/// entity_name = "entity"
///
/// [server]                    # 可选
/// listen = "0.0.0.0:7000"
///
/// [client]                    # 可选
/// address = "127.0.0.1"
/// port = 7000
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub runtime: RuntimeSection,
    pub session: SessionSection,
    pub tls: Option<TlsSection>,
    pub server: Option<ServerSection>,
    pub client: Option<ClientSection>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSection {
    pub worker_threads: Option<usize>,
    pub log_filter: String,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            worker_threads: None,
            log_filter: "info".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub receive_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub nodelay: bool,
    pub keepalive: bool,
    pub linger_secs: Option<u64>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            receive_timeout_secs: 0,
            connect_timeout_secs: 10,
            nodelay: true,
            keepalive: false,
            linger_secs: None,
        }
    }
}

impl SessionSection {
    /// 接收超时；`Duration::ZERO` 表示关闭。
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn socket_config(&self) -> TcpSocketConfig {
        TcpSocketConfig::new()
            .with_nodelay(self.nodelay)
            .with_keepalive(self.keepalive)
            .with_linger(self.linger_secs.map(Duration::from_secs))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    pub verify_host: String,
    pub keys_path: PathBuf,
    #[serde(default = "default_entity_name")]
    pub entity_name: String,
}

fn default_entity_name() -> String {
    "entity".to_owned()
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub listen: SocketAddr,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    pub address: String,
    pub port: u16,
}

impl HostConfig {
    /// 读取并校验配置文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 语义校验。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.worker_threads == Some(0) {
            return Err(ConfigError::Invalid(
                "runtime.worker_threads must be at least 1".to_owned(),
            ));
        }
        if self.session.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.connect_timeout_secs must be at least 1".to_owned(),
            ));
        }
        if let Some(tls) = &self.tls {
            if tls.verify_host.is_empty() {
                return Err(ConfigError::Invalid("tls.verify_host must not be empty".to_owned()));
            }
            if tls.entity_name.is_empty() {
                return Err(ConfigError::Invalid("tls.entity_name must not be empty".to_owned()));
            }
        }
        Ok(())
    }
}
