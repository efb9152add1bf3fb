use std::io;
use std::time::Duration;

use socket2::SockRef;

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 会话在 `start` 阶段调用传输的 `init()`，由它把本配置落到内核：`TCP_NODELAY`
///   让小包请求/应答不被 Nagle 算法拖延，`SO_LINGER` 决定关闭时未发送数据的命运，
///   `SO_KEEPALIVE` 让长时间静默的半开连接最终被内核探测出来；
/// - 调用方不需要直接接触 `socket2` 或平台常量。
///
/// ## 核心逻辑（How）
/// - 通过 `socket2::SockRef` 借用已建立连接的描述符，逐项设置选项；
/// - `linger = None` 表示遵循内核默认策略。
///
/// ## 契约说明（What）
/// - 默认值：`nodelay = true`、`keepalive = false`、`linger = None`；
/// - **前置条件**：`apply` 的目标必须是已连接的 TCP 描述符；
/// - **后置条件**：返回 `Ok(())` 时所有选项均已生效；任一选项失败即返回该错误。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在不同平台的精度不同（Linux 取整到秒），若设置过小，仍在发送缓冲区的数据
///   可能被丢弃并触发对端 `ECONNRESET`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
    keepalive: bool,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    /// 创建默认配置。
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: true,
            keepalive: false,
        }
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// 设置 `TCP_NODELAY`。
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 设置 `SO_KEEPALIVE`。
    pub fn with_keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    pub(crate) fn apply(&self, socket: SockRef<'_>) -> io::Result<()> {
        socket.set_tcp_nodelay(self.nodelay)?;
        socket.set_linger(self.linger)?;
        socket.set_keepalive(self.keepalive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_methods_override_defaults() {
        let config = TcpSocketConfig::default();
        assert!(config.nodelay());
        assert!(!config.keepalive());
        assert_eq!(config.linger(), None);

        let config = config
            .with_nodelay(false)
            .with_keepalive(true)
            .with_linger(Some(Duration::from_secs(2)));
        assert!(!config.nodelay());
        assert!(config.keepalive());
        assert_eq!(config.linger(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn apply_sets_options_on_a_connected_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let stream = std::net::TcpStream::connect(addr).expect("connect");
        let config = TcpSocketConfig::new()
            .with_nodelay(true)
            .with_keepalive(true)
            .with_linger(Some(Duration::from_secs(1)));

        config.apply(SockRef::from(&stream)).expect("apply");

        let sock = SockRef::from(&stream);
        assert!(sock.tcp_nodelay().expect("nodelay"));
        assert!(sock.keepalive().expect("keepalive"));
        assert_eq!(sock.linger().expect("linger"), Some(Duration::from_secs(1)));
    }
}
