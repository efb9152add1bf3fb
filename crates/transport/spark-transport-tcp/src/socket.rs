use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use socket2::SockRef;
use spark_runtime::Executor;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, trace, warn};

use crate::config::TcpSocketConfig;
use crate::error::{
    CONFIGURE, CONNECT, HANDSHAKE, OperationKind, READ, TLS_SETUP, TransportError, WRITE,
};
use crate::tls::{HandshakeRole, TlsParameters};

type TlsTcpStream = TlsStream<TcpStream>;

/// 读半部：明文与 TLS 共用同一调用面。
#[derive(Debug)]
enum ReadStream {
    Plain(OwnedReadHalf),
    Tls(ReadHalf<TlsTcpStream>),
}

/// 写半部。
#[derive(Debug)]
enum WriteStream {
    Plain(OwnedWriteHalf),
    Tls(WriteHalf<TlsTcpStream>),
}

impl ReadStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read_exact(buf).await,
            Self::Tls(stream) => stream.read_exact(buf).await,
        }
    }
}

impl WriteStream {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf).await,
            Self::Tls(stream) => {
                let written = stream.write(buf).await?;
                stream.flush().await?;
                Ok(written)
            }
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(buf).await,
            Self::Tls(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await
            }
        }
    }
}

fn split_plain(stream: TcpStream) -> (ReadStream, WriteStream) {
    let (reader, writer) = stream.into_split();
    (ReadStream::Plain(reader), WriteStream::Plain(writer))
}

fn split_tls(stream: TlsTcpStream) -> (ReadStream, WriteStream) {
    let (reader, writer) = tokio::io::split(stream);
    (ReadStream::Tls(reader), WriteStream::Tls(writer))
}

/// 已安装流的元数据与控制句柄。
#[derive(Debug)]
struct Control {
    /// 复制出的描述符，用于设置选项与 `shutdown`，不参与读写。
    socket: socket2::Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

#[derive(Debug)]
struct SocketInner {
    executor: Executor,
    config: TcpSocketConfig,
    tls: Mutex<Option<TlsParameters>>,
    ssl: AtomicBool,
    initialized: AtomicBool,
    control: Mutex<Option<Control>>,
    reader: AsyncMutex<Option<ReadStream>>,
    writer: AsyncMutex<Option<WriteStream>>,
    closed: watch::Sender<bool>,
}

/// 明文/TLS 统一的 TCP 字节流传输。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 会话层只写一次读写逻辑，就能同时服务明文与 TLS 连接：TLS 的启用只是“设置参数 +
///   插入一次握手”，之后的 `read_some`/`write_all` 调用面完全不变；
/// - 本端关闭必须能立即唤醒所有挂起的读写与连接，否则会话的关闭流程会被一个永远不
///   返回的读操作拖住。
///
/// ## 逻辑 (How)
/// - 连接建立后流被拆成读、写两个半部，各自由 `tokio::sync::Mutex` 保护，一读一写可以
///   同时在途；
/// - 另复制一份描述符作为控制句柄，用于设置套接字选项和 `shutdown`，不与读写争锁；
/// - 所有异步操作都与一个 `watch` 关闭信号竞速（`select!` 带 `biased`），关闭时以
///   [`ErrorCategory::Aborted`](crate::ErrorCategory::Aborted) 失败；
/// - 握手时把两个半部重新合并为 `TcpStream`，交给 `tokio-rustls` 后再拆分为 TLS 半部。
///
/// ## 契约 (What)
/// - `TcpSocket` 是共享句柄，克隆后指向同一连接；
/// - `close()` 幂等，只有真正执行关闭的那次调用返回 `true`；关闭是单调的，之后的所有
///   操作都以 `Aborted` 失败；
/// - `handshake`/`init_ssl` 失败时传输不会自行关闭，由调用方决定；
/// - `init()` 可重复调用；在未连接的传输上调用会被记录，待流安装后再落地选项。
///
/// ## 注意事项 (Trade-offs)
/// - 握手需要同时拿到读写两把锁，因此必须在开始正常读写之前完成；
/// - 关闭时若读写半部仍被在途操作持有，它们在操作被中止后才会释放，底层连接在此之前
///   已经被 `shutdown` 终止。
#[derive(Clone, Debug)]
pub struct TcpSocket {
    inner: Arc<SocketInner>,
}

impl TcpSocket {
    /// 创建一个尚未连接的传输。
    pub fn new(executor: &Executor, config: TcpSocketConfig) -> Self {
        Self::build(executor, config, None, None)
    }

    /// 包装一个已经接受的连接。
    pub fn from_stream(
        executor: &Executor,
        stream: TcpStream,
        config: TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        let control = control_for(&stream).map_err(|err| TransportError::from_io(CONFIGURE, err))?;
        Ok(Self::build(
            executor,
            config,
            Some(control),
            Some(split_plain(stream)),
        ))
    }

    fn build(
        executor: &Executor,
        config: TcpSocketConfig,
        control: Option<Control>,
        halves: Option<(ReadStream, WriteStream)>,
    ) -> Self {
        let (reader, writer) = match halves {
            Some((reader, writer)) => (Some(reader), Some(writer)),
            None => (None, None),
        };
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(SocketInner {
                executor: executor.clone(),
                config,
                tls: Mutex::new(None),
                ssl: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                control: Mutex::new(control),
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(writer),
                closed,
            }),
        }
    }

    /// 套接字配置。
    pub fn config(&self) -> &TcpSocketConfig {
        &self.inner.config
    }

    /// 把套接字配置落到内核。
    pub fn init(&self) -> Result<(), TransportError> {
        self.inner.initialized.store(true, Ordering::Release);
        let control = self.inner.control.lock();
        match control.as_ref() {
            Some(control) => self
                .inner
                .config
                .apply(SockRef::from(&control.socket))
                .map_err(|err| TransportError::from_io(CONFIGURE, err)),
            None => Ok(()),
        }
    }

    /// 配置证书校验目标与身份材料，必须在握手之前调用。
    pub fn set_ssl_parameters(
        &self,
        verify_host: impl Into<String>,
        keys_path: impl Into<std::path::PathBuf>,
        entity_name: impl Into<String>,
    ) {
        let params = TlsParameters::new(verify_host, keys_path, entity_name);
        debug!(
            verify_host = params.verify_host(),
            entity = params.entity_name(),
            "tls parameters configured"
        );
        *self.inner.tls.lock() = Some(params);
    }

    /// 当前 TLS 参数快照。
    pub fn ssl_parameters(&self) -> Option<TlsParameters> {
        self.inner.tls.lock().clone()
    }

    /// 主动连接到 `addr`。
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        self.until_closed(CONNECT, async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|err| TransportError::from_io(CONNECT, err))?;
            self.install(stream).await
        })
        .await
    }

    async fn install(&self, stream: TcpStream) -> Result<(), TransportError> {
        let control = control_for(&stream).map_err(|err| TransportError::from_io(CONNECT, err))?;
        let mut reader = self.inner.reader.lock().await;
        let mut writer = self.inner.writer.lock().await;
        {
            let mut slot = self.inner.control.lock();
            if *self.inner.closed.borrow() {
                return Err(TransportError::aborted(CONNECT));
            }
            if slot.is_some() {
                return Err(TransportError::from_io(
                    CONNECT,
                    io::Error::other("transport is already connected"),
                ));
            }
            if self.inner.initialized.load(Ordering::Acquire) {
                self.inner
                    .config
                    .apply(SockRef::from(&control.socket))
                    .map_err(|err| TransportError::from_io(CONFIGURE, err))?;
            }
            debug!(peer = %control.peer_addr, local = %control.local_addr, "tcp connected");
            *slot = Some(control);
        }
        let (read_half, write_half) = split_plain(stream);
        *reader = Some(read_half);
        *writer = Some(write_half);
        Ok(())
    }

    /// 读取至多 `buf.len()` 字节；返回 `Ok(0)` 表示对端已关闭写方向。
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.until_closed(READ, async {
            let mut reader = self.inner.reader.lock().await;
            let stream = reader
                .as_mut()
                .ok_or_else(|| TransportError::not_connected(READ))?;
            let read = stream
                .read(buf)
                .await
                .map_err(|err| TransportError::from_io(READ, err))?;
            trace!(bytes = read, "tcp read");
            Ok(read)
        })
        .await
    }

    /// 恰好读满 `buf`；中途遇到 EOF 以断开类错误失败。
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.until_closed(READ, async {
            let mut reader = self.inner.reader.lock().await;
            let stream = reader
                .as_mut()
                .ok_or_else(|| TransportError::not_connected(READ))?;
            let read = stream
                .read_exact(buf)
                .await
                .map_err(|err| TransportError::from_io(READ, err))?;
            trace!(bytes = read, "tcp read exact");
            Ok(read)
        })
        .await
    }

    /// 写出 `buf` 的一个前缀，返回写出的字节数。
    pub async fn write_some(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.until_closed(WRITE, async {
            let mut writer = self.inner.writer.lock().await;
            let stream = writer
                .as_mut()
                .ok_or_else(|| TransportError::not_connected(WRITE))?;
            let written = stream
                .write(buf)
                .await
                .map_err(|err| TransportError::from_io(WRITE, err))?;
            trace!(bytes = written, "tcp write");
            Ok(written)
        })
        .await
    }

    /// 写出整个 `buf`，成功时返回 `buf.len()`。
    pub async fn write_all(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.until_closed(WRITE, async {
            let mut writer = self.inner.writer.lock().await;
            let stream = writer
                .as_mut()
                .ok_or_else(|| TransportError::not_connected(WRITE))?;
            stream
                .write_all(buf)
                .await
                .map_err(|err| TransportError::from_io(WRITE, err))?;
            trace!(bytes = buf.len(), "tcp write all");
            Ok(buf.len())
        })
        .await
    }

    /// 以 `role` 执行 TLS 握手，成功后传输切换到 TLS 模式。
    pub async fn handshake(&self, role: HandshakeRole) -> Result<(), TransportError> {
        let params = self.ssl_parameters().ok_or_else(|| {
            TransportError::configuration(
                TLS_SETUP,
                io::Error::new(io::ErrorKind::InvalidInput, "tls parameters are not set"),
            )
        })?;

        self.until_closed(HANDSHAKE, async {
            let mut reader = self.inner.reader.lock().await;
            let mut writer = self.inner.writer.lock().await;
            let stream = match (reader.take(), writer.take()) {
                (Some(ReadStream::Plain(read)), Some(WriteStream::Plain(write))) => {
                    read.reunite(write).map_err(|err| {
                        TransportError::from_io(HANDSHAKE, io::Error::other(err.to_string()))
                    })?
                }
                (Some(read @ ReadStream::Tls(_)), Some(write @ WriteStream::Tls(_))) => {
                    *reader = Some(read);
                    *writer = Some(write);
                    return Err(TransportError::from_io(
                        HANDSHAKE,
                        io::Error::other("tls is already active"),
                    ));
                }
                _ => return Err(TransportError::not_connected(HANDSHAKE)),
            };

            let tls: TlsTcpStream = match role {
                HandshakeRole::Client => {
                    let connector = TlsConnector::from(Arc::new(params.client_config()?));
                    let name = params.server_name()?;
                    connector
                        .connect(name, stream)
                        .await
                        .map_err(|err| TransportError::from_io(HANDSHAKE, err))?
                        .into()
                }
                HandshakeRole::Server => {
                    let acceptor = TlsAcceptor::from(Arc::new(params.server_config()?));
                    acceptor
                        .accept(stream)
                        .await
                        .map_err(|err| TransportError::from_io(HANDSHAKE, err))?
                        .into()
                }
            };

            let (read_half, write_half) = split_tls(tls);
            *reader = Some(read_half);
            *writer = Some(write_half);
            self.inner.ssl.store(true, Ordering::Release);
            debug!(?role, "tls handshake completed");
            Ok(())
        })
        .await
    }

    /// 回调式握手：在执行基座上运行 [`TcpSocket::handshake`]，完成后恰好调用一次
    /// `on_complete(success)`。
    pub fn init_ssl<F>(&self, role: HandshakeRole, on_complete: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let socket = self.clone();
        self.inner.executor.spawn(async move {
            let success = match socket.handshake(role).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(code = err.code(), ?role, error = %err, "tls handshake failed");
                    false
                }
            };
            on_complete(success);
        });
    }

    /// 关闭传输；只有真正执行关闭的调用返回 `true`。
    pub fn close(&self) -> bool {
        if self.inner.closed.send_replace(true) {
            return false;
        }
        if let Some(control) = self.inner.control.lock().take() {
            // 对端可能已先行关闭，shutdown 失败不影响本端释放。
            if let Err(err) = control.socket.shutdown(Shutdown::Both) {
                trace!(error = %err, "tcp shutdown on close");
            }
            debug!(peer = %control.peer_addr, "tcp closed");
        }
        self.release_streams();
        true
    }

    /// 是否已连接且尚未关闭。
    pub fn is_open(&self) -> bool {
        !*self.inner.closed.borrow() && self.inner.control.lock().is_some()
    }

    /// 是否已被关闭。
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// 是否已完成 TLS 握手。
    pub fn is_ssl(&self) -> bool {
        self.inner.ssl.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.control.lock().as_ref().map(|c| c.local_addr)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.control.lock().as_ref().map(|c| c.peer_addr)
    }

    /// 执行基座句柄。
    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// 让 `operation` 与关闭信号竞速。
    async fn until_closed<T, F>(&self, kind: OperationKind, operation: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::aborted(kind));
        }
        let result = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::aborted(kind)),
            result = operation => result,
        };
        if matches!(&result, Err(err) if err.is_aborted()) {
            self.release_streams();
        }
        result
    }

    /// 关闭后尽早释放空闲的读写半部；仍被占用的半部由在途操作结束后再次释放。
    fn release_streams(&self) {
        if !*self.inner.closed.borrow() {
            return;
        }
        if let Ok(mut reader) = self.inner.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
    }
}

fn control_for(stream: &TcpStream) -> io::Result<Control> {
    Ok(Control {
        socket: SockRef::from(stream).try_clone()?,
        local_addr: stream.local_addr()?,
        peer_addr: stream.peer_addr()?,
    })
}
