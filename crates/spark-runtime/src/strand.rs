use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::executor::Executor;

/// 单个 drainer 连续执行的任务数上限，达到后让出工作线程。
const FAIRNESS_BUDGET: usize = 64;

type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

struct StrandQueue<S> {
    tasks: VecDeque<Task<S>>,
    /// `Some` 表示当前没有 drainer 在运行，状态停放在队列中。
    parked: Option<S>,
}

struct StrandInner<S> {
    executor: Executor,
    queue: Mutex<StrandQueue<S>>,
}

/// 每对象串行域：经由同一个 `Strand` 提交的任务按提交顺序执行且永不交叠。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接对象的 I/O 完成可能在任意工作线程上被派发。与其给每个字段加锁，不如让所有
///   触碰状态的代码都排进同一条队列，从而在不跨 `.await` 持锁的前提下获得互斥；
/// - 把被保护的状态 `S` 交给 Strand 持有：只有正在执行任务的 drainer 才能拿到 `&mut S`，
///   “状态只在串行域内被访问”由类型系统而非约定来保证。
///
/// ## 逻辑（How）
/// 1. `post` 在短暂的互斥区内把任务压入队列；若状态处于停放状态，说明没有 drainer，
///    则取出状态并向执行基座提交一个新的 drainer；
/// 2. drainer 在锁外执行任务，每次只在锁内弹出一个任务；队列为空时把状态停放回去；
/// 3. 每执行 64 个任务让出一次工作线程，避免高频对象饿死其他连接；
/// 4. 任务 panic 会被捕获并以 `error!` 记录，状态与后续任务不受影响。
///
/// ## 契约（What）
/// - 同一 Strand 上的任务：FIFO、互不交叠、永不在 `post` 调用栈内内联执行；
/// - 任务内再次 `post` 的任务会排在当前任务之后；
/// - 不同 Strand 之间不提供任何顺序保证；
/// - `post` 本身不会失败。
///
/// ## 注意事项（Trade-offs）
/// - 队列互斥锁只保护 `VecDeque` 的压入/弹出，临界区极短，不会跨越用户代码；
/// - 执行基座关停后提交的 drainer 不会运行，其携带的状态随任务一起被释放。
pub struct Strand<S> {
    inner: Arc<StrandInner<S>>,
}

impl<S> Clone for Strand<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Strand<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.inner.queue.lock();
        f.debug_struct("Strand")
            .field("queued", &queue.tasks.len())
            .field("running", &queue.parked.is_none())
            .finish()
    }
}

impl<S: Send + 'static> Strand<S> {
    /// 创建绑定到 `executor` 的 Strand，并接管 `state`。
    pub fn new(executor: &Executor, state: S) -> Self {
        Self {
            inner: Arc::new(StrandInner {
                executor: executor.clone(),
                queue: Mutex::new(StrandQueue {
                    tasks: VecDeque::new(),
                    parked: Some(state),
                }),
            }),
        }
    }

    /// 提交任务。
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        schedule(&self.inner, Box::new(task));
    }

    /// 把 `f` 包装为一个普通回调；回调被调用时，`f` 经由本 Strand 执行。
    ///
    /// 常用于把 I/O 完成回调路由回串行域：`socket.init_ssl(role, strand.wrap(|state, ok| ...))`。
    pub fn wrap<A, F>(&self, f: F) -> impl FnOnce(A) + Send + 'static
    where
        A: Send + 'static,
        F: FnOnce(&mut S, A) + Send + 'static,
    {
        let strand = self.clone();
        move |arg| strand.post(move |state| f(state, arg))
    }

    /// 获取弱引用，供定时器等“寄居在状态内部”的组件使用以避免引用环。
    pub fn downgrade(&self) -> WeakStrand<S> {
        WeakStrand {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Strand 所绑定的执行基座。
    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }
}

/// [`Strand`] 的弱引用。
pub struct WeakStrand<S> {
    inner: Weak<StrandInner<S>>,
}

impl<S> Clone for WeakStrand<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for WeakStrand<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakStrand")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl<S: Send + 'static> WeakStrand<S> {
    /// 升级为强引用；Strand 已释放时返回 `None`。
    pub fn upgrade(&self) -> Option<Strand<S>> {
        self.inner.upgrade().map(|inner| Strand { inner })
    }

    /// 若 Strand 仍存活则提交任务，返回是否提交成功。
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        match self.inner.upgrade() {
            Some(inner) => {
                schedule(&inner, Box::new(task));
                true
            }
            None => false,
        }
    }
}

fn schedule<S: Send + 'static>(inner: &Arc<StrandInner<S>>, task: Task<S>) {
    let parked = {
        let mut queue = inner.queue.lock();
        queue.tasks.push_back(task);
        queue.parked.take()
    };
    if let Some(state) = parked {
        inner.executor.spawn(drain(Arc::clone(inner), state));
    }
}

async fn drain<S: Send + 'static>(inner: Arc<StrandInner<S>>, mut state: S) {
    let mut executed = 0usize;
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            match queue.tasks.pop_front() {
                Some(task) => task,
                None => {
                    queue.parked = Some(state);
                    trace!(executed, "strand drained");
                    return;
                }
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(&mut state))) {
            error!(panic = panic_message(payload.as_ref()), "strand task panicked");
        }

        executed += 1;
        if executed % FAIRNESS_BUDGET == 0 {
            tokio::task::yield_now().await;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
