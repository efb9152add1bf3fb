//! 会话状态机的端到端测试。
//!
//! # 教案式说明
//! - **意图（Why）**：关闭的幂等性、写后关闭的顺序、接收超时与静默断开都是“多线程下
//!   才会暴露”的性质，这里全部在多线程运行时与真实回环套接字上验证；
//! - **逻辑（How）**：订阅者把事件写入无界通道，测试端以超时等待断言事件序列；
//! - **契约（What）**：每个测试自建监听器，互不共享端口。

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use spark_runtime::Executor;
use spark_session::{READ_BUFFER_SIZE, Session, SessionError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};

const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Start,
    Data(Vec<u8>),
    Error(&'static str),
    WriteDone,
    Close,
    Destroy(bool),
}

/// 订阅会话的全部通知，并把它们按发生顺序送入通道。
fn record(session: &Session) -> UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = tx.clone();
    session.on_start.connect(move |_| {
        let _ = sink.send(Event::Start);
    });
    let sink = tx.clone();
    session.on_data.connect(move |bytes: &[u8]| {
        let _ = sink.send(Event::Data(bytes.to_vec()));
    });
    let sink = tx.clone();
    session.on_error.connect(move |err| {
        let _ = sink.send(Event::Error(err.code()));
    });
    let sink = tx.clone();
    session.on_write_done.connect(move |_| {
        let _ = sink.send(Event::WriteDone);
    });
    let sink = tx.clone();
    session.on_close.connect(move |_| {
        let _ = sink.send(Event::Close);
    });
    session.on_destroy.connect(move |started| {
        let _ = tx.send(Event::Destroy(*started));
    });
    rx
}

async fn next(events: &mut UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event should arrive in time")
        .expect("event channel open")
}

/// 断言在 `window` 内没有新事件。
async fn quiet(events: &mut UnboundedReceiver<Event>, window: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(window, events.recv()).await {
        panic!("unexpected event {event:?}");
    }
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
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

/// 只接受连接，把对端流交给测试自行驱动。
async fn scripted_server() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if tx.send(stream).is_err() {
                break;
            }
        }
    });
    (addr, rx)
}

async fn connected_session(addr: SocketAddr) -> Arc<Session> {
    let session = Session::new(&Executor::current());
    session.socket().connect(addr).await.expect("connect");
    session
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hello_round_trip_through_loopback_echo() {
    let addr = echo_server().await;
    let session = connected_session(addr).await;
    let mut events = record(&session);

    session.start();
    assert_eq!(next(&mut events).await, Event::Start);
    assert!(session.started());

    session.write_all(&b"hello"[..]).expect("write admitted");
    session.read_all(5).expect("read admitted");

    let mut saw_write_done = false;
    let mut data = None;
    while data.is_none() || !saw_write_done {
        match next(&mut events).await {
            Event::WriteDone => saw_write_done = true,
            Event::Data(bytes) => data = Some(bytes),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(data.as_deref(), Some(&b"hello"[..]));

    session.close();
    assert_eq!(next(&mut events).await, Event::Close);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_closes_fire_close_exactly_once() {
    let addr = echo_server().await;
    let session = connected_session(addr).await;
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    session.on_close.connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    session.start();

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                for _ in 0..16 {
                    session.close();
                }
            })
        })
        .collect();
    for closer in closers {
        closer.join().expect("closer thread");
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(session.is_closed());
    assert!(session.socket().is_closed());
    assert!(session.on_close.is_empty(), "subscriptions are severed at close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_write_is_rejected() {
    let (addr, mut peers) = scripted_server().await;
    let session = connected_session(addr).await;
    let _peer = peers.recv().await.expect("peer");
    session.start();

    // 对端不读取，大块写必然长时间在途。
    session
        .write_all(vec![0u8; 32 * 1024 * 1024])
        .expect("first write admitted");
    assert_eq!(
        session.write_all(&b"second"[..]),
        Err(SessionError::WriteInFlight)
    );
    session.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_on_write_waits_for_the_in_flight_write() {
    let addr = echo_server().await;
    let session = connected_session(addr).await;
    let mut events = record(&session);
    session.start();
    assert_eq!(next(&mut events).await, Event::Start);

    session.write_all(&b"bye"[..]).expect("write admitted");
    session.close_on_write();

    assert_eq!(next(&mut events).await, Event::WriteDone);
    assert_eq!(next(&mut events).await, Event::Close);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_on_write_without_write_closes_immediately() {
    let addr = echo_server().await;
    let session = connected_session(addr).await;
    let mut events = record(&session);
    session.start();
    assert_eq!(next(&mut events).await, Event::Start);

    session.close_on_write();
    assert_eq!(next(&mut events).await, Event::Close);
    assert!(session.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receive_timeout_closes_without_error() {
    let (addr, mut peers) = scripted_server().await;
    let session = connected_session(addr).await;
    let _silent_peer = peers.recv().await.expect("peer");
    let mut events = record(&session);

    session.set_receive_timeout(Duration::from_millis(150));
    session.start();
    assert_eq!(next(&mut events).await, Event::Start);
    session.read_some(64).expect("read admitted");

    assert_eq!(next(&mut events).await, Event::Close);
    assert!(session.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn data_before_timeout_disarms_the_timer() {
    let (addr, mut peers) = scripted_server().await;
    let session = connected_session(addr).await;
    let mut peer = peers.recv().await.expect("peer");
    let mut events = record(&session);

    session.set_receive_timeout(Duration::from_millis(300));
    session.start();
    assert_eq!(next(&mut events).await, Event::Start);
    peer.write_all(b"x").await.expect("peer write");
    session.read_some(64).expect("read admitted");

    assert_eq!(next(&mut events).await, Event::Data(b"x".to_vec()));
    quiet(&mut events, Duration::from_millis(600)).await;
    assert!(!session.is_closed());
    session.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_fin_closes_silently() {
    let (addr, mut peers) = scripted_server().await;
    let session = connected_session(addr).await;
    let peer = peers.recv().await.expect("peer");
    let mut events = record(&session);

    session.start();
    assert_eq!(next(&mut events).await, Event::Start);
    session.read_some(64).expect("read admitted");
    drop(peer);

    assert_eq!(next(&mut events).await, Event::Close);
    quiet(&mut events, Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_argument_and_overlap_errors() {
    let (addr, mut peers) = scripted_server().await;
    let session = connected_session(addr).await;
    let _peer = peers.recv().await.expect("peer");
    session.start();

    assert!(matches!(
        session.read_all(0),
        Err(SessionError::InvalidReadSize { requested: 0, .. })
    ));
    assert!(matches!(
        session.read_all(READ_BUFFER_SIZE + 1),
        Err(SessionError::InvalidReadSize { .. })
    ));
    assert!(session.read_some(0).is_err());

    session.read_some(usize::MAX).expect("clamped to buffer capacity");
    assert_eq!(session.read_some(16), Err(SessionError::ReadInFlight));
    session.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operations_after_close_have_no_effect() {
    let addr = echo_server().await;
    let session = connected_session(addr).await;
    session.start();
    session.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.is_closed());

    let writes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&writes);
    session.on_write_done.connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    session.write_all(&b"late"[..]).expect("silently dropped");
    session.read_some(8).expect("silently dropped");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(writes.load(Ordering::SeqCst), 0);
    session
        .write_all(&b"again"[..])
        .expect("write gate is released after the dropped write");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroy_reports_whether_the_session_started() {
    let unused = Session::new(&Executor::current());
    let mut events = record(&unused);
    drop(unused);
    assert_eq!(next(&mut events).await, Event::Destroy(false));

    let addr = echo_server().await;
    let session = connected_session(addr).await;
    let mut events = record(&session);
    session.start();
    assert_eq!(next(&mut events).await, Event::Start);
    session.close();
    assert_eq!(next(&mut events).await, Event::Close);
    drop(session);
    assert_eq!(next(&mut events).await, Event::Destroy(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscriber_holding_the_session_does_not_leak() {
    let addr = echo_server().await;
    let session = connected_session(addr).await;
    let mut events = record(&session);

    // 订阅闭包回指会话形成引用环，关闭时切断订阅即可打破。
    let held = Arc::clone(&session);
    session.on_data.connect(move |_| {
        let _ = held.started();
    });
    session.start();
    assert_eq!(next(&mut events).await, Event::Start);
    session.close();
    assert_eq!(next(&mut events).await, Event::Close);
    drop(session);
    assert_eq!(next(&mut events).await, Event::Destroy(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_handshake_closes_the_session() {
    let (addr, mut peers) = scripted_server().await;
    let session = connected_session(addr).await;
    let _peer = peers.recv().await.expect("peer");
    let mut events = record(&session);
    session.start();
    assert_eq!(next(&mut events).await, Event::Start);

    // 未设置 TLS 参数，握手必然失败。
    session.start_ssl(spark_session::HandshakeRole::Client, || {
        panic!("on_ready must not run after a failed handshake")
    });
    assert_eq!(next(&mut events).await, Event::Close);
    quiet(&mut events, Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_error_is_reported_before_close() {
    // 未连接的传输上读取会得到 Transport 类错误，而不是静默的断开。
    let session = Session::new(&Executor::current());
    let mut events = record(&session);

    session.start();
    assert_eq!(next(&mut events).await, Event::Start);
    session.read_some(16).expect("read admitted");

    assert_eq!(
        next(&mut events).await,
        Event::Error("spark.transport.tcp.read_failed")
    );
    assert_eq!(next(&mut events).await, Event::Close);
    assert!(session.is_closed());
    quiet(&mut events, Duration::from_millis(200)).await;

    drop(session);
    assert_eq!(next(&mut events).await, Event::Destroy(true));
}
