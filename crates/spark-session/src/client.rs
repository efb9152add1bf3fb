use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use spark_runtime::{Executor, Strand, Timer};
use spark_transport_tcp::TransportError;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::self_handle::{SelfHandle, SharedFromThis};
use crate::session::Session;
use crate::signal::Signal;

/// 默认连接超时。
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct ClientState {
    connect_timeout: Duration,
    timer: Option<Timer<ClientState>>,
    next_attempt: u64,
    /// 当前在途的连接尝试编号。
    pending: Option<u64>,
}

/// 主动连接助手：驱动目标会话的传输建立连接，并与连接超时竞速。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 连接完成与超时触发必须互斥：两者都经由客户端自己的 [`Strand`] 派发，先到者清除
///   在途尝试编号，后到者发现编号不匹配即被丢弃，因此 `on_connect` 对每次尝试恰好触发一次；
///
/// ## 逻辑 (How)
/// 1. `connect_to` 在 Strand 内分配尝试编号并武装连接定时器；
/// 2. 在执行基座上发起 `socket.connect`，完成后回到 Strand：编号匹配则停止定时器并以
///    连接结果触发 `on_connect`；
/// 3. 定时器先触发时关闭目标会话（从而中止在途连接），并以 `false` 触发 `on_connect`。
///
/// ## 契约 (What)
/// - 未设置目标会话时 `connect` 为空操作；
/// - 新的连接尝试会取代尚未完成的旧尝试，旧尝试的结果被静默丢弃；
/// - `on_connect` 在客户端 Strand 内触发，参数为是否连接成功；
/// - 连接成功后由调用方对会话执行 `start()`。
pub struct Client {
    handle: SelfHandle<Client>,
    strand: Strand<ClientState>,
    session: ArcSwapOption<Session>,
    /// 连接结果通知。
    pub on_connect: Signal<bool>,
}

impl SharedFromThis for Client {
    fn self_handle(&self) -> &SelfHandle<Self> {
        &self.handle
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session.load().as_ref().map(|s| s.id()))
            .finish()
    }
}

impl Client {
    pub fn new(executor: &Executor) -> Arc<Self> {
        Arc::new_cyclic(|weak| Client {
            handle: SelfHandle::new(weak.clone()),
            strand: Strand::new(
                executor,
                ClientState {
                    connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                    timer: None,
                    next_attempt: 0,
                    pending: None,
                },
            ),
            session: ArcSwapOption::empty(),
            on_connect: Signal::new(),
        })
    }

    /// 设置目标会话。
    pub fn set_session(&self, session: Arc<Session>) {
        self.session.store(Some(session));
    }

    /// 目标会话。
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.load_full()
    }

    /// 设置连接超时，从下一次连接尝试起生效。
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.strand.post(move |state| {
            state.connect_timeout = timeout;
            if let Some(timer) = state.timer.as_mut() {
                timer.set_duration(timeout);
            }
        });
    }

    /// 连接到 `address:port`，`address` 必须是 IP 字面量。
    pub fn connect(&self, address: &str, port: u16) -> Result<(), ClientError> {
        let ip: IpAddr = address.parse().map_err(|_| ClientError::InvalidAddress {
            address: address.to_owned(),
        })?;
        self.connect_to(SocketAddr::new(ip, port));
        Ok(())
    }

    /// 连接到 `addr`。
    pub fn connect_to(&self, addr: SocketAddr) {
        let Some(session) = self.session.load_full() else {
            debug!(%addr, "connect ignored: no target session");
            return;
        };
        let Some(this) = self.shared_from_this() else {
            return;
        };
        self.strand
            .post(move |state| this.begin_connect(state, session, addr));
    }

    fn begin_connect(self: &Arc<Self>, state: &mut ClientState, session: Arc<Session>, addr: SocketAddr) {
        state.next_attempt += 1;
        let attempt = state.next_attempt;
        if let Some(superseded) = state.pending.replace(attempt) {
            debug!(superseded, attempt, "connect attempt superseded");
        }

        let timeout = state.connect_timeout;
        let timer = state
            .timer
            .get_or_insert_with(|| Timer::new(&self.strand, timeout));
        timer.stop();
        let weak = self.weak_from_this();
        let target = Arc::clone(&session);
        let armed = timer.start(move |state| {
            if let Some(this) = weak.upgrade() {
                this.on_connect_timeout(state, attempt, &target);
            }
        });
        if let Err(err) = armed {
            warn!(attempt, %err, "connect timer could not be armed");
        }

        debug!(attempt, %addr, session = session.id(), "connecting");
        let this = Arc::clone(self);
        self.strand.executor().spawn(async move {
            let result = session.socket().connect(addr).await;
            let strand = this.strand.clone();
            strand.post(move |state| this.on_connect_complete(state, attempt, result));
        });
    }

    fn on_connect_complete(
        &self,
        state: &mut ClientState,
        attempt: u64,
        result: Result<(), TransportError>,
    ) {
        if state.pending != Some(attempt) {
            debug!(attempt, "stale connect completion discarded");
            return;
        }
        state.pending = None;
        if let Some(timer) = state.timer.as_mut() {
            timer.stop();
        }
        let connected = match result {
            Ok(()) => {
                debug!(attempt, "connected");
                true
            }
            Err(err) => {
                warn!(attempt, code = err.code(), error = %err, "connect failed");
                false
            }
        };
        self.on_connect.emit(&connected);
    }

    fn on_connect_timeout(&self, state: &mut ClientState, attempt: u64, session: &Session) {
        if state.pending != Some(attempt) {
            return;
        }
        state.pending = None;
        warn!(attempt, session = session.id(), "connect timed out");
        session.close();
        self.on_connect.emit(&false);
    }
}
