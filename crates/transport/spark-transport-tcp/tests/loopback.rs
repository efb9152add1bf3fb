//! 明文回环测试：连接、读写、关闭语义与错误分类。
//!
//! # 教案式说明
//! - **意图（Why）**：传输层的“关闭立即唤醒挂起操作”“EOF 归类为断开”是会话层静默
//!   关闭与幂等关闭的基础，必须在真实套接字上验证；
//! - **契约（What）**：所有测试绑定 `127.0.0.1:0`，互不干扰。

use std::net::SocketAddr;
use std::time::Duration;

use spark_runtime::Executor;
use spark_transport_tcp::{ErrorCategory, TcpListener, TcpSocket, TcpSocketConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn echo_listener() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_write_and_read_back() {
    let addr = echo_listener().await;
    let socket = TcpSocket::new(&Executor::current(), TcpSocketConfig::default());
    assert!(!socket.is_open());

    socket.connect(addr).await.expect("connect");
    socket.init().expect("init");
    assert!(socket.is_open());
    assert!(!socket.is_ssl());
    assert_eq!(socket.peer_addr(), Some(addr));

    assert_eq!(socket.write_all(b"hello").await.expect("write"), 5);
    let mut buf = [0u8; 5];
    assert_eq!(socket.read_exact(&mut buf).await.expect("read"), 5);
    assert_eq!(&buf, b"hello");

    let written = socket.write_some(b"abc").await.expect("write some");
    assert!(written > 0 && written <= 3);
    let mut buf = [0u8; 16];
    let read = socket.read_some(&mut buf).await.expect("read some");
    assert!(read > 0);
    assert!(b"abc".starts_with(&buf[..read]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent_and_safe_when_never_opened() {
    let socket = TcpSocket::new(&Executor::current(), TcpSocketConfig::default());
    assert!(socket.close());
    assert!(!socket.close());
    assert!(socket.is_closed());

    let addr = echo_listener().await;
    let connected = TcpSocket::new(&Executor::current(), TcpSocketConfig::default());
    connected.connect(addr).await.expect("connect");
    let clone = connected.clone();
    assert!(clone.close());
    assert!(!connected.close());
    assert!(!connected.is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_wakes_a_pending_read_with_aborted() {
    let addr = echo_listener().await;
    let socket = TcpSocket::new(&Executor::current(), TcpSocketConfig::default());
    socket.connect(addr).await.expect("connect");

    let reader = socket.clone();
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        reader.read_some(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(socket.close());

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("read should wake")
        .expect("join");
    let error = result.expect_err("read must fail after close");
    assert_eq!(error.category(), ErrorCategory::Aborted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn operations_after_close_are_aborted() {
    let addr = echo_listener().await;
    let socket = TcpSocket::new(&Executor::current(), TcpSocketConfig::default());
    socket.close();
    let error = socket.connect(addr).await.expect_err("closed socket");
    assert!(error.is_aborted());
    let error = socket.write_all(b"x").await.expect_err("closed socket");
    assert!(error.is_aborted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn io_on_unconnected_socket_is_a_transport_error() {
    let socket = TcpSocket::new(&Executor::current(), TcpSocketConfig::default());
    let mut buf = [0u8; 4];
    let error = socket.read_some(&mut buf).await.expect_err("not connected");
    assert_eq!(error.category(), ErrorCategory::Transport);
    assert_eq!(error.code(), "spark.transport.tcp.read_failed");
    socket.init().expect("init on unconnected socket is recorded");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_fin_is_eof_and_exact_read_reports_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0".parse().expect("addr"))
        .await
        .expect("bind");
    let addr = listener.local_addr();
    let executor = Executor::current();

    let client = tokio::spawn(async move {
        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        stream.write_all(b"ab").await.expect("write");
        stream.shutdown().await.expect("fin");
    });
    let (socket, _) = listener.accept(&executor).await.expect("accept");
    client.await.expect("client");

    let mut buf = [0u8; 4];
    let error = socket.read_exact(&mut buf).await.expect_err("short read");
    assert!(error.is_disconnect());
    let read = socket.read_some(&mut buf).await.expect("eof");
    assert_eq!(read, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_refused_is_reported_not_disconnect() {
    let unused = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    };
    let socket = TcpSocket::new(&Executor::current(), TcpSocketConfig::default());
    let error = socket.connect(unused).await.expect_err("refused");
    assert!(!error.is_disconnect());
    assert_eq!(error.code(), "spark.transport.tcp.connect_failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accepted_socket_inherits_listener_config() {
    let config = TcpSocketConfig::default().with_keepalive(true);
    let listener = TcpListener::bind_with_config("127.0.0.1:0".parse().expect("addr"), config.clone())
        .await
        .expect("bind");
    let addr = listener.local_addr();
    let _client = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let (socket, _) = listener.accept(&Executor::current()).await.expect("accept");
    assert_eq!(socket.config(), &config);
    socket.init().expect("init");
    assert_eq!(socket.local_addr(), Some(addr));
}
