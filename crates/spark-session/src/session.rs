use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use spark_runtime::{Executor, Strand, Timer};
use spark_transport_tcp::error::{READ, WRITE};
use spark_transport_tcp::{HandshakeRole, TcpSocket, TcpSocketConfig, TransportError};
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::self_handle::{SelfHandle, SharedFromThis};
use crate::signal::Signal;

/// 读缓冲区容量（128 KiB）。
pub const READ_BUFFER_SIZE: usize = 64 * 2 * 1024;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 只在会话 Strand 内被访问的状态。
struct SessionState {
    /// 读缓冲区；读操作在途时借给该操作，完成后归还。
    read_buffer: Option<Box<[u8]>>,
    close_on_write: bool,
    closed: bool,
    receive_timer: Option<Timer<SessionState>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            read_buffer: Some(vec![0u8; READ_BUFFER_SIZE].into_boxed_slice()),
            close_on_write: false,
            closed: false,
            receive_timer: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum ReadMode {
    Exact(usize),
    Some(usize),
}

impl ReadMode {
    fn len(self) -> usize {
        match self {
            Self::Exact(len) | Self::Some(len) => len,
        }
    }
}

/// 单条连接的状态机：启动、读、写、关闭与生命周期通知。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - I/O 完成可能在线程池的任意线程上到达；会话把应用调用与 I/O 完成全部汇入自己的
///   [`Strand`]，读缓冲区、`closed`/`close_on_write` 标记与接收定时器因此只会被一个
///   逻辑控制流触碰，无需为它们加锁；
/// - 关闭是唯一的终止动作：对端断开、传输错误、接收超时、写后关闭最终都走同一条
///   `close` 路径，并保证关闭通知恰好触发一次。
///
/// ## 体系定位（Architecture）
/// - 会话独占一个 [`TcpSocket`] 与一个 Strand；自身以 `Arc` 共享，持有者包括应用外壳
///   与每一个在途异步操作，最后一个持有者释放时触发销毁通知；
/// - 订阅闭包可能回指会话形成引用环，关闭时切断除销毁通知外的全部订阅即可打破环。
///
/// ## 核心逻辑（How）
/// - `start`：经 Strand 标记已启动、触发启动通知、初始化传输；
/// - `read_all`/`read_some`：武装接收定时器，借出读缓冲区发起读取；完成后回到 Strand，
///   停止定时器、归还缓冲区，再投递数据或进入错误处理；
/// - `write_all`：单写在途，重叠写被同步拒绝；写完成后触发写完成通知，若期间请求了
///   写后关闭则随即关闭；
/// - 错误处理：断开（EOF/重置）与本端中止静默关闭，其余错误先触发错误通知再关闭。
///
/// ## 契约说明（What）
/// - `closed` 单调：置位后读写请求都被静默丢弃，不再触发任何通知；
/// - 任一时刻至多一个写、一个读在途；违反时返回 [`SessionError`]，会话状态不受影响；
/// - 订阅者观察到的序列：至多一次错误通知或一次超时关闭，随后恰好一次关闭通知，
///   最终一次销毁通知（携带会话是否曾启动）；
/// - 所有通知都在会话 Strand 内触发。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - 读写准入用原子标记在调用线程上同步判定，这样重叠调用能直接得到错误返回值；
///   真正的状态变更仍在 Strand 内完成；
/// - 接收定时器的回调只持有弱引用，定时器不会单独延长会话寿命。
pub struct Session {
    id: u64,
    handle: SelfHandle<Session>,
    strand: Strand<SessionState>,
    socket: TcpSocket,
    started: AtomicBool,
    closed: AtomicBool,
    writing: AtomicBool,
    reading: AtomicBool,
    /// 收到数据。
    pub on_data: Signal<[u8]>,
    /// 非断开类传输错误。
    pub on_error: Signal<TransportError>,
    /// 一次 `write_all` 完成。
    pub on_write_done: Signal<()>,
    /// 会话已启动。
    pub on_start: Signal<()>,
    /// 会话已关闭。
    pub on_close: Signal<()>,
    /// 会话销毁，参数为是否曾启动；关闭时不会被切断。
    pub on_destroy: Signal<bool>,
}

impl SharedFromThis for Session {
    fn self_handle(&self) -> &SelfHandle<Self> {
        &self.handle
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("started", &self.started())
            .field("closed", &self.is_closed())
            .field("writing", &self.writing.load(Ordering::Acquire))
            .finish()
    }
}

impl Session {
    /// 创建一个使用默认套接字配置、尚未连接的会话（通常交给 `Client` 连接）。
    pub fn new(executor: &Executor) -> Arc<Self> {
        Self::with_config(executor, TcpSocketConfig::default())
    }

    /// 创建一个尚未连接的会话，并指定套接字配置。
    pub fn with_config(executor: &Executor, config: TcpSocketConfig) -> Arc<Self> {
        Self::with_socket(executor, TcpSocket::new(executor, config))
    }

    /// 以已接受的连接创建会话。
    pub fn with_socket(executor: &Executor, socket: TcpSocket) -> Arc<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "session created");
        Arc::new_cyclic(|weak| Session {
            id,
            handle: SelfHandle::new(weak.clone()),
            strand: Strand::new(executor, SessionState::new()),
            socket,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            on_data: Signal::new(),
            on_error: Signal::new(),
            on_write_done: Signal::new(),
            on_start: Signal::new(),
            on_close: Signal::new(),
            on_destroy: Signal::new(),
        })
    }

    /// 进程内唯一的会话编号，仅用于日志关联。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 底层传输，用于设置 TLS 参数或由 `Client` 发起连接。
    pub fn socket(&self) -> &TcpSocket {
        &self.socket
    }

    pub fn executor(&self) -> &Executor {
        self.strand.executor()
    }

    /// 是否已启动。
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// 是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 启动会话：标记已启动、触发启动通知并初始化传输。重复调用无效果。
    pub fn start(&self) {
        self.post(|this, state| this.start_in_strand(state));
    }

    /// 执行 TLS 握手；成功后在 Strand 内调用 `on_ready`，失败则关闭会话。
    pub fn start_ssl<F>(&self, role: HandshakeRole, on_ready: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(move |this, state| {
            if state.closed {
                return;
            }
            let target = Arc::clone(this);
            this.socket.init_ssl(
                role,
                this.strand.wrap(move |state: &mut SessionState, success: bool| {
                    if state.closed {
                        return;
                    }
                    if success {
                        debug!(session = target.id, ?role, "session tls ready");
                        on_ready();
                    } else {
                        target.close_in_strand(state);
                    }
                }),
            );
        });
    }

    /// 读取恰好 `size` 字节，成功后经 `on_data` 投递。
    pub fn read_all(&self, size: usize) -> Result<(), SessionError> {
        if size == 0 || size > READ_BUFFER_SIZE {
            return Err(SessionError::InvalidReadSize {
                requested: size,
                capacity: READ_BUFFER_SIZE,
            });
        }
        self.begin_read(ReadMode::Exact(size))
    }

    /// 读取 1 到 `min(max_size, READ_BUFFER_SIZE)` 字节，成功后经 `on_data` 投递。
    pub fn read_some(&self, max_size: usize) -> Result<(), SessionError> {
        if max_size == 0 {
            return Err(SessionError::InvalidReadSize {
                requested: max_size,
                capacity: READ_BUFFER_SIZE,
            });
        }
        self.begin_read(ReadMode::Some(max_size.min(READ_BUFFER_SIZE)))
    }

    /// 写出全部 `data`；上一次写未完成时返回 [`SessionError::WriteInFlight`]。
    ///
    /// 会话已关闭时请求被静默丢弃。
    pub fn write_all(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        if self
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(session = self.id, "write rejected: previous write still in flight");
            return Err(SessionError::WriteInFlight);
        }
        let data = data.into();
        if !self.post(move |this, state| this.write_in_strand(state, data)) {
            self.writing.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// 请求写后关闭：若没有写在途则立即关闭，否则在当前写完成后关闭。
    pub fn close_on_write(&self) {
        self.post(|this, state| {
            if state.closed {
                return;
            }
            state.close_on_write = true;
            if !this.writing.load(Ordering::Acquire) {
                this.close_in_strand(state);
            }
        });
    }

    /// 关闭会话。并发调用安全，关闭通知只触发一次。
    pub fn close(&self) {
        self.post(|this, state| this.close_in_strand(state));
    }

    /// 设置接收超时；`Duration::ZERO` 表示关闭接收超时。
    ///
    /// 新值从下一次读取开始生效。
    pub fn set_receive_timeout(&self, timeout: Duration) {
        self.post(move |this, state| {
            if timeout.is_zero() {
                state.receive_timer = None;
                return;
            }
            match state.receive_timer.as_mut() {
                Some(timer) => timer.set_duration(timeout),
                None => state.receive_timer = Some(Timer::new(&this.strand, timeout)),
            }
        });
    }

    /// 把任务投递进会话 Strand，任务持有会话的强引用直至执行完毕。
    ///
    /// 会话正在析构时返回 `false`。
    fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce(&Arc<Session>, &mut SessionState) + Send + 'static,
    {
        match self.shared_from_this() {
            Some(this) => {
                self.strand.post(move |state| task(&this, state));
                true
            }
            None => false,
        }
    }

    fn start_in_strand(&self, state: &mut SessionState) {
        if state.closed || self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(session = self.id, "session started");
        self.on_start.emit(&());
        if let Err(err) = self.socket.init() {
            warn!(session = self.id, code = err.code(), error = %err, "socket init failed");
        }
    }

    fn begin_read(&self, mode: ReadMode) -> Result<(), SessionError> {
        if self
            .reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::ReadInFlight);
        }
        if !self.post(move |this, state| this.read_in_strand(state, mode)) {
            self.reading.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn read_in_strand(self: &Arc<Self>, state: &mut SessionState, mode: ReadMode) {
        if state.closed {
            self.reading.store(false, Ordering::Release);
            return;
        }
        let Some(mut buffer) = state.read_buffer.take() else {
            self.reading.store(false, Ordering::Release);
            return;
        };
        self.arm_receive_timer(state);

        let this = Arc::clone(self);
        self.strand.executor().spawn(async move {
            let len = mode.len();
            let result = match mode {
                ReadMode::Exact(_) => this.socket.read_exact(&mut buffer[..len]).await,
                ReadMode::Some(_) => this.socket.read_some(&mut buffer[..len]).await,
            };
            let strand = this.strand.clone();
            strand.post(move |state| this.on_read_complete(state, mode, buffer, result));
        });
    }

    fn arm_receive_timer(&self, state: &mut SessionState) {
        let Some(timer) = state.receive_timer.as_mut() else {
            return;
        };
        let weak = self.weak_from_this();
        let armed = timer.start(move |state| {
            if let Some(this) = weak.upgrade() {
                this.on_receive_timeout(state);
            }
        });
        if let Err(err) = armed {
            trace!(session = self.id, %err, "receive timer left armed");
        }
    }

    fn on_receive_timeout(&self, state: &mut SessionState) {
        if state.closed {
            return;
        }
        debug!(session = self.id, "receive timeout, closing session");
        self.close_in_strand(state);
    }

    fn on_read_complete(
        &self,
        state: &mut SessionState,
        mode: ReadMode,
        buffer: Box<[u8]>,
        result: Result<usize, TransportError>,
    ) {
        if let Some(timer) = state.receive_timer.as_mut() {
            timer.stop();
        }
        self.reading.store(false, Ordering::Release);
        if state.closed {
            state.read_buffer = Some(buffer);
            return;
        }

        match result {
            Ok(0) => {
                state.read_buffer = Some(buffer);
                self.error_handler(state, TransportError::end_of_stream(READ));
            }
            Ok(read) => match mode {
                ReadMode::Exact(expected) if read != expected => {
                    state.read_buffer = Some(buffer);
                    self.error_handler(state, TransportError::short_transfer(READ, expected, read));
                }
                _ => {
                    trace!(session = self.id, bytes = read, "session read");
                    self.on_data.emit(&buffer[..read]);
                    state.read_buffer = Some(buffer);
                }
            },
            Err(err) => {
                state.read_buffer = Some(buffer);
                self.error_handler(state, err);
            }
        }
    }

    fn write_in_strand(self: &Arc<Self>, state: &mut SessionState, data: Bytes) {
        if state.closed {
            self.writing.store(false, Ordering::Release);
            return;
        }
        let this = Arc::clone(self);
        self.strand.executor().spawn(async move {
            let expected = data.len();
            let result = this.socket.write_all(&data).await;
            let strand = this.strand.clone();
            strand.post(move |state| this.on_write_complete(state, expected, result));
        });
    }

    fn on_write_complete(
        &self,
        state: &mut SessionState,
        expected: usize,
        result: Result<usize, TransportError>,
    ) {
        self.writing.store(false, Ordering::Release);
        if state.closed {
            return;
        }
        match result {
            Ok(written) if written == expected => {
                trace!(session = self.id, bytes = written, "session write done");
                self.on_write_done.emit(&());
                if state.close_on_write {
                    self.close_in_strand(state);
                }
            }
            Ok(written) => {
                self.error_handler(state, TransportError::short_transfer(WRITE, expected, written));
            }
            Err(err) => self.error_handler(state, err),
        }
    }

    /// 所有错误路径的汇合点：断开与中止静默关闭，其余错误先通知再关闭。
    fn error_handler(&self, state: &mut SessionState, error: TransportError) {
        if error.is_disconnect() || error.is_aborted() {
            debug!(session = self.id, code = error.code(), "session disconnected");
        } else {
            warn!(session = self.id, code = error.code(), error = %error, "session transport error");
            self.on_error.emit(&error);
        }
        self.close_in_strand(state);
    }

    fn close_in_strand(&self, state: &mut SessionState) {
        if state.closed {
            return;
        }
        state.closed = true;
        self.closed.store(true, Ordering::Release);
        self.socket.close();
        if let Some(timer) = state.receive_timer.as_mut() {
            timer.stop();
        }
        debug!(session = self.id, "session closed");
        self.on_close.emit(&());
        self.disconnect_all_slots();
    }

    /// 切断除销毁通知外的全部订阅。
    fn disconnect_all_slots(&self) {
        self.on_data.disconnect_all();
        self.on_error.disconnect_all();
        self.on_write_done.disconnect_all();
        self.on_start.disconnect_all();
        self.on_close.disconnect_all();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let was_started = self.started.load(Ordering::Acquire);
        debug!(session = self.id, was_started, "session destroyed");
        self.on_destroy.emit(&was_started);
        self.socket.close();
    }
}
