use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

type Slot<A> = Arc<dyn Fn(&A) + Send + Sync + 'static>;

/// 订阅句柄，用于 [`Signal::disconnect`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

struct Slots<A: ?Sized> {
    next_id: u64,
    entries: Vec<(SlotId, Slot<A>)>,
}

/// 多播通知：任意数量的订阅者，按订阅顺序依次调用。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 会话的每一种生命周期事件（数据、错误、写完成、启动、关闭、销毁）都需要一个
///   显式的观察者列表，并且能在关闭时一次性清空，以切断订阅闭包持有的回指引用；
///
/// ## 逻辑（How）
/// - 订阅表由互斥锁保护；`emit` 先在锁内复制一份 `Arc` 快照，再在锁外逐个调用，
///   因此订阅者可以在回调中再次 `connect`/`disconnect` 而不会死锁；
///
/// ## 契约（What）
/// - 调用顺序等于订阅顺序；
/// - `emit` 开始后新增的订阅不会收到本次通知，被移除的订阅仍可能收到本次通知；
/// - `disconnect_all` 之后，订阅闭包（及其捕获的引用）在最后一次在途 `emit` 结束时释放。
pub struct Signal<A: ?Sized> {
    slots: Mutex<Slots<A>>,
}

impl<A: ?Sized> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ?Sized> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").field("slots", &self.len()).finish()
    }
}

impl<A: ?Sized> Signal<A> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }

    /// 订阅通知。
    pub fn connect<F>(&self, slot: F) -> SlotId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let mut slots = self.slots.lock();
        let id = SlotId(slots.next_id);
        slots.next_id += 1;
        slots.entries.push((id, Arc::new(slot)));
        id
    }

    /// 移除一个订阅，返回它是否存在。
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.entries.len();
        slots.entries.retain(|(slot_id, _)| *slot_id != id);
        slots.entries.len() != before
    }

    /// 移除全部订阅。
    pub fn disconnect_all(&self) {
        let drained = std::mem::take(&mut self.slots.lock().entries);
        // 在锁外释放闭包：闭包析构可能再次触碰本信号。
        drop(drained);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 依订阅顺序通知所有订阅者。
    pub fn emit(&self, value: &A) {
        let snapshot: Vec<Slot<A>> = self
            .slots
            .lock()
            .entries
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in snapshot {
            slot(value);
        }
    }
}
