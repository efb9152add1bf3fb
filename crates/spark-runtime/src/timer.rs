use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::executor::Executor;
use crate::strand::{Strand, WeakStrand};

/// 定时器使用错误。
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// 已有一次待触发的计时。
    #[error("timer is already armed")]
    AlreadyArmed,
}

/// 武装状态与代际号。
///
/// 代际号每次武装、每次取消都会递增；排入 Strand 的触发任务只认自己出生时的代际号，
/// 因此“取消之后才被调度到的触发”必然落空。
#[derive(Default)]
struct TimerSlot {
    epoch: AtomicU64,
    armed: AtomicBool,
}

/// 绑定到 [`Strand`] 的一次性可取消定时器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 接收超时与连接超时都需要“延迟一段时间后在所属串行域内执行回调”，且必须能在
///   回调送达之前可靠撤销；
/// - 触发与取消都经过同一个 Strand，二者因此不可能交错出歧义：要么回调先执行，之后的
///   `stop` 是空操作；要么 `stop` 先执行，之后到达的触发被丢弃。
///
/// ## 逻辑 (How)
/// - `start` 在执行基座上启动一个 `sleep`，到期后向 Strand 投递触发任务；
/// - 触发任务先比对代际号，再以 `swap(false)` 消费武装标记，两者都成立才调用回调；
/// - `stop` 清除武装标记、递增代际号并中止尚未到期的 `sleep`。
///
/// ## 契约 (What)
/// - 定时器通常存放在它所绑定 Strand 的状态 `S` 中，并只在该 Strand 的任务里被调用；
/// - 持有的是 [`WeakStrand`]，不会与 Strand 形成引用环；Strand 先于定时器释放时触发被静默丢弃；
/// - 触发或取消后都可以再次 `start`；
/// - `Drop` 会中止尚未到期的计时。
pub struct Timer<S> {
    strand: WeakStrand<S>,
    executor: Executor,
    duration: Duration,
    slot: Arc<TimerSlot>,
    pending: Option<AbortHandle>,
}

impl<S> fmt::Debug for Timer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("duration", &self.duration)
            .field("armed", &self.slot.armed.load(Ordering::Acquire))
            .finish()
    }
}

impl<S: Send + 'static> Timer<S> {
    /// 创建一个尚未武装的定时器。
    pub fn new(strand: &Strand<S>, duration: Duration) -> Self {
        Self {
            strand: strand.downgrade(),
            executor: strand.executor().clone(),
            duration,
            slot: Arc::new(TimerSlot::default()),
            pending: None,
        }
    }

    /// 武装定时器；到期后 `on_fire` 经由所属 Strand 执行。
    pub fn start<F>(&mut self, on_fire: F) -> Result<(), TimerError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.slot.armed.swap(true, Ordering::AcqRel) {
            return Err(TimerError::AlreadyArmed);
        }
        let epoch = self.slot.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = Arc::clone(&self.slot);
        let strand = self.strand.clone();
        let duration = self.duration;
        let sleeper = self.executor.spawn(async move {
            tokio::time::sleep(duration).await;
            strand.post(move |state| {
                if slot.epoch.load(Ordering::Acquire) == epoch
                    && slot.armed.swap(false, Ordering::AcqRel)
                {
                    trace!(?duration, "timer fired");
                    on_fire(state);
                }
            });
        });
        if let Some(previous) = self.pending.replace(sleeper.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    /// 取消尚未送达的触发，返回是否真的撤销了一次触发。
    pub fn stop(&mut self) -> bool {
        let pending = self.pending.take();
        if !self.slot.armed.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.slot.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(sleeper) = pending {
            sleeper.abort();
        }
        true
    }

    /// 是否存在待触发的计时。
    pub fn is_armed(&self) -> bool {
        self.slot.armed.load(Ordering::Acquire)
    }

    /// 当前时长。
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// 修改时长，从下一次 `start` 起生效。
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }
}

impl<S> Drop for Timer<S> {
    fn drop(&mut self) {
        if let Some(sleeper) = self.pending.take() {
            sleeper.abort();
        }
    }
}
