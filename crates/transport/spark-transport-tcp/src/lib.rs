#![deny(unsafe_code)]
#![doc = r#"
# spark-transport-tcp

## 教案式导读

- **意图（Why）**：为会话层提供一个与模式无关的字节流传输。明文与 TLS 连接暴露
  完全相同的 `connect`/`read_*`/`write_*` 调用面，TLS 只是“设置参数 + 一次握手”。
- **结构（How）**：
  - [`TcpSocket`]：可克隆的传输句柄，读写半部独立加锁，所有操作与关闭信号竞速；
  - [`TlsParameters`] / [`HandshakeRole`]：证书校验目标、密钥目录与握手角色；
  - [`TcpSocketConfig`]：`TCP_NODELAY`、`SO_LINGER`、`SO_KEEPALIVE`；
  - [`TransportError`] / [`ErrorCategory`]：稳定错误码与断开/中止/安全/配置等分类；
  - [`TcpListener`]：入站连接的接受入口。
- **契约（What）**：传输从不自行关闭；何时关闭由持有它的会话决定。
"#]

mod config;
pub mod error;
mod listener;
mod socket;
mod tls;

pub use config::TcpSocketConfig;
pub use error::{ErrorCategory, OperationKind, TransportError};
pub use listener::TcpListener;
pub use socket::TcpSocket;
pub use tls::{CA_FILE, HandshakeRole, TlsParameters};
