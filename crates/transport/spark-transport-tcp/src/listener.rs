use std::net::SocketAddr;

use spark_runtime::Executor;
use tokio::net::TcpListener as TokioTcpListener;
use tracing::debug;

use crate::config::TcpSocketConfig;
use crate::error::{ACCEPT, BIND, TransportError};
use crate::socket::TcpSocket;

/// 对 Tokio `TcpListener` 的语义封装，产出入站会话所需的 [`TcpSocket`]。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端会话以“已接受的原始连接”构造；监听器负责把 Tokio 流包装成带配置的传输，
///   让应用外壳只需 `accept → Session::with_socket → start`。
///
/// ## 逻辑 (How)
/// - `bind_with_config` 缓存默认 [`TcpSocketConfig`]，之后每条连接都继承它；
/// - `accept` 成功后立即建立控制句柄，套接字选项在会话 `start` 时由 `init()` 落地。
///
/// ## 契约 (What)
/// - **前置条件**：必须在 Tokio 运行时中使用；
/// - **错误语义**：绑定/接受失败时返回带稳定错误码（`bind_failed`/`accept_failed`）的
///   [`TransportError`]。
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: SocketAddr,
    default_config: TcpSocketConfig,
}

impl TcpListener {
    /// 绑定到指定地址并返回监听器。
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::bind_with_config(addr, TcpSocketConfig::default()).await
    }

    /// 绑定到指定地址并设置新连接的默认套接字配置。
    pub async fn bind_with_config(
        addr: SocketAddr,
        default_config: TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|err| TransportError::from_io(BIND, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| TransportError::from_io(BIND, err))?;
        debug!(%local_addr, "tcp listening");
        Ok(Self {
            inner: listener,
            local_addr,
            default_config,
        })
    }

    /// 返回监听器实际绑定的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn default_socket_config(&self) -> &TcpSocketConfig {
        &self.default_config
    }

    /// 接受一个入站连接。
    pub async fn accept(
        &self,
        executor: &Executor,
    ) -> Result<(TcpSocket, SocketAddr), TransportError> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(|err| TransportError::from_io(ACCEPT, err))?;
        debug!(%peer, "tcp accepted");
        let socket = TcpSocket::from_stream(executor, stream, self.default_config.clone())?;
        Ok((socket, peer))
    }
}
