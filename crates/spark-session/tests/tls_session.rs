//! TLS 会话端到端测试：服务端会话与客户端会话各自 `start_ssl`，握手完成后使用与
//! 明文完全相同的读写接口。

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use spark_runtime::Executor;
use spark_session::{HandshakeRole, Session};
use spark_transport_tcp::{CA_FILE, TcpListener};
use tokio::sync::mpsc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tls_sessions_exchange_data_after_on_ready() {
    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).expect("certificate");
    let server_keys = tempfile::tempdir().expect("server dir");
    let client_keys = tempfile::tempdir().expect("client dir");
    fs::write(server_keys.path().join("node.crt"), certified.cert.pem()).expect("crt");
    fs::write(
        server_keys.path().join("node.key"),
        certified.key_pair.serialize_pem(),
    )
    .expect("key");
    fs::write(client_keys.path().join(CA_FILE), certified.cert.pem()).expect("ca");

    let executor = Executor::current();
    let listener = TcpListener::bind("127.0.0.1:0".parse().expect("addr"))
        .await
        .expect("bind");
    let addr = listener.local_addr();

    let client = Session::new(&executor);
    client
        .socket()
        .set_ssl_parameters("localhost", client_keys.path(), "node");
    let connecting = Arc::clone(&client);
    let connect = tokio::spawn(async move { connecting.socket().connect(addr).await });

    let (socket, _) = listener.accept(&executor).await.expect("accept");
    connect.await.expect("join").expect("connect");
    socket.set_ssl_parameters("localhost", server_keys.path(), "node");
    let server = Session::with_socket(&executor, socket);

    // 服务端：握手完成后回显一次 4 字节报文。
    let (echoed_tx, mut echoed_rx) = mpsc::unbounded_channel();
    let responder = Arc::downgrade(&server);
    server.on_data.connect(move |bytes: &[u8]| {
        if let Some(server) = responder.upgrade() {
            let _ = server.write_all(bytes.to_vec());
        }
        let _ = echoed_tx.send(());
    });
    server.start();
    let reader = Arc::downgrade(&server);
    server.start_ssl(HandshakeRole::Server, move || {
        if let Some(server) = reader.upgrade() {
            let _ = server.read_all(4);
        }
    });

    // 客户端：握手完成后发送并读取回显。
    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    client.on_data.connect(move |bytes: &[u8]| {
        let _ = data_tx.send(bytes.to_vec());
    });
    client.start();
    let writer = Arc::downgrade(&client);
    client.start_ssl(HandshakeRole::Client, move || {
        if let Some(client) = writer.upgrade() {
            let _ = client.write_all(&b"tls!"[..]);
            let _ = client.read_all(4);
        }
    });

    tokio::time::timeout(Duration::from_secs(5), echoed_rx.recv())
        .await
        .expect("server received in time");
    let echoed = tokio::time::timeout(Duration::from_secs(5), data_rx.recv())
        .await
        .expect("client received in time")
        .expect("channel open");
    assert_eq!(echoed, b"tls!");
    assert!(client.socket().is_ssl());
    assert!(server.socket().is_ssl());

    client.close();
    server.close();
}
