#![deny(unsafe_code)]
#![doc = r#"
# spark-session

## 教案式导读

- **意图（Why）**：在多线程执行基座上管理大量连接，同时保证每条连接自己的状态
  只被一个逻辑控制流触碰。
- **结构（How）**：
  - [`Session`]：单连接状态机（启动、读、写、写后关闭、关闭、接收超时、TLS 启动），
    通过 [`Signal`] 暴露生命周期通知；
  - [`Client`]：驱动目标会话发起连接，并与连接超时竞速；
  - [`SelfHandle`] / [`SharedFromThis`]：在 `&self` 方法中取得自身 `Arc` 的能力；
  - [`SessionError`] / [`ClientError`]：同步返回给调用方的使用错误。
- **契约（What）**：所有 I/O 层失败都在会话内部转换为通知，不跨越异步边界抛出；
  `close` 是每条错误路径的终点。
"#]

mod client;
mod error;
mod self_handle;
mod session;
mod signal;

pub use client::{Client, DEFAULT_CONNECT_TIMEOUT};
pub use error::{ClientError, SessionError};
pub use self_handle::{SelfHandle, SharedFromThis};
pub use session::{READ_BUFFER_SIZE, Session};
pub use signal::{Signal, SlotId};

pub use spark_transport_tcp::{HandshakeRole, TcpSocket, TcpSocketConfig, TransportError};
