//! 回显示例：服务端把收到的每个数据块原样写回；客户端发送一条消息并等待同样长度的回显。

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use spark_hosting::{
    Application, HostArgs, HostContext, Mode, SessionSection, TlsSection, run_application,
};
use spark_runtime::Executor;
use spark_session::{Client, HandshakeRole, READ_BUFFER_SIZE, Session, TcpSocket};
use spark_transport_tcp::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    run_application(HostArgs::parse(), EchoApp::default())
}

#[derive(Default)]
struct EchoApp {
    accept_task: Option<JoinHandle<()>>,
    client: Option<Arc<Client>>,
    session: Option<Arc<Session>>,
}

impl Application for EchoApp {
    fn start(&mut self, ctx: &HostContext) -> anyhow::Result<()> {
        match ctx.args().mode {
            Mode::Server => self.start_server(ctx),
            Mode::Client => self.start_client(ctx),
        }
    }

    fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.client = None;
    }
}

impl EchoApp {
    fn start_server(&mut self, ctx: &HostContext) -> anyhow::Result<()> {
        let config = ctx.config();
        let listen = config
            .server
            .as_ref()
            .map(|server| server.listen)
            .context("server mode requires a [server] section")?;
        let executor = ctx.executor().clone();
        let session_config = config.session.clone();
        let tls = config.tls.clone();
        let shutdown = ctx.shutdown_handle();

        self.accept_task = Some(ctx.spawn(async move {
            if let Err(err) = accept_loop(executor, listen, session_config, tls).await {
                error!(%listen, error = %err, "echo server stopped");
                shutdown.request();
            }
        }));
        Ok(())
    }

    fn start_client(&mut self, ctx: &HostContext) -> anyhow::Result<()> {
        let config = ctx.config();
        let target = config
            .client
            .clone()
            .context("client mode requires a [client] section")?;
        let message = ctx.args().message.clone().into_bytes();
        if message.is_empty() || message.len() > READ_BUFFER_SIZE {
            bail!("message must be between 1 and {READ_BUFFER_SIZE} bytes");
        }

        let session = Session::with_config(ctx.executor(), config.session.socket_config());
        session.set_receive_timeout(config.session.receive_timeout());
        let secure = configure_tls(session.socket(), config.tls.as_ref());
        let shutdown = ctx.shutdown_handle();

        let weak = Arc::downgrade(&session);
        session.on_data.connect({
            let weak = weak.clone();
            move |data: &[u8]| {
                println!("{}", String::from_utf8_lossy(data));
                if let Some(session) = weak.upgrade() {
                    session.close();
                }
            }
        });
        session.on_error.connect(|err| error!(code = err.code(), error = %err, "echo client failed"));
        session.on_close.connect({
            let shutdown = shutdown.clone();
            move |_| shutdown.request()
        });

        let client = Client::new(ctx.executor());
        client.set_connect_timeout(config.session.connect_timeout());
        client.set_session(Arc::clone(&session));
        client.on_connect.connect(move |connected| {
            if !*connected {
                error!("echo client could not connect");
                shutdown.request();
                return;
            }
            let Some(session) = weak.upgrade() else {
                return;
            };
            session.start();
            if secure {
                let weak = weak.clone();
                let message = message.clone();
                session.start_ssl(HandshakeRole::Client, move || send_message(&weak, message));
            } else {
                send_message(&weak, message.clone());
            }
        });
        client
            .connect(&target.address, target.port)
            .with_context(|| format!("connecting to {}:{}", target.address, target.port))?;

        self.client = Some(client);
        self.session = Some(session);
        Ok(())
    }
}

fn configure_tls(socket: &TcpSocket, tls: Option<&TlsSection>) -> bool {
    match tls {
        Some(tls) => {
            socket.set_ssl_parameters(&tls.verify_host, &tls.keys_path, &tls.entity_name);
            true
        }
        None => false,
    }
}

fn send_message(session: &Weak<Session>, message: Vec<u8>) {
    let Some(session) = session.upgrade() else {
        return;
    };
    let len = message.len();
    if let Err(err) = session.write_all(message) {
        warn!(%err, "echo request not sent");
        session.close();
        return;
    }
    if let Err(err) = session.read_all(len) {
        warn!(%err, "echo reply not requested");
        session.close();
    }
}

async fn accept_loop(
    executor: Executor,
    listen: SocketAddr,
    session_config: SessionSection,
    tls: Option<TlsSection>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind_with_config(listen, session_config.socket_config()).await?;
    info!(local = %listener.local_addr(), tls = tls.is_some(), "echo server listening");
    loop {
        match listener.accept(&executor).await {
            Ok((socket, peer)) => serve(&executor, socket, peer, &session_config, tls.as_ref()),
            Err(err) => {
                warn!(code = err.code(), error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// 为入站连接建立回显会话；会话由在途读写持有，关闭后自然释放。
fn serve(
    executor: &Executor,
    socket: TcpSocket,
    peer: SocketAddr,
    session_config: &SessionSection,
    tls: Option<&TlsSection>,
) {
    let secure = configure_tls(&socket, tls);
    let session = Session::with_socket(executor, socket);
    session.set_receive_timeout(session_config.receive_timeout());
    let weak = Arc::downgrade(&session);

    session.on_data.connect({
        let weak = weak.clone();
        move |data: &[u8]| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            if let Err(err) = session.write_all(data.to_vec()) {
                warn!(session = session.id(), %err, "echo dropped");
                session.close();
            }
        }
    });
    session.on_write_done.connect({
        let weak = weak.clone();
        move |_| request_read(&weak)
    });
    session.on_error.connect(move |err| {
        warn!(%peer, code = err.code(), error = %err, "echo session failed");
    });
    session.on_close.connect(move |_| debug!(%peer, "echo session closed"));
    session.on_destroy.connect(move |started| {
        debug!(%peer, started = *started, "echo session released");
    });

    info!(%peer, session = session.id(), "echo session accepted");
    session.start();
    if secure {
        session.start_ssl(HandshakeRole::Server, move || request_read(&weak));
    } else {
        request_read(&weak);
    }
}

fn request_read(session: &Weak<Session>) {
    if let Some(session) = session.upgrade() {
        if let Err(err) = session.read_some(READ_BUFFER_SIZE) {
            warn!(session = session.id(), %err, "echo read not requested");
            session.close();
        }
    }
}
