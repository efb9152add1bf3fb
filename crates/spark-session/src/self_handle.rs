use std::fmt;
use std::sync::{Arc, Weak};

/// 对象持有的“指向自己”的弱引用。
///
/// # 教案式注释
///
/// - **意图（Why）**：会话在 `&self` 方法里发起异步操作时，需要把一个强引用交给在途
///   操作以保证对象存活到完成；弱引用在构造时通过 [`Arc::new_cyclic`] 建立，不依赖
///   任何运行时反射；
/// - **契约（What）**：对象析构开始后 `upgrade` 返回 `None`，调用方应把这种情况当作
///   “对象正在销毁，放弃本次操作”。
pub struct SelfHandle<T> {
    weak: Weak<T>,
}

impl<T> SelfHandle<T> {
    pub fn new(weak: Weak<T>) -> Self {
        Self { weak }
    }

    pub fn upgrade(&self) -> Option<Arc<T>> {
        self.weak.upgrade()
    }

    pub fn downgrade(&self) -> Weak<T> {
        Weak::clone(&self.weak)
    }
}

impl<T> Clone for SelfHandle<T> {
    fn clone(&self) -> Self {
        Self {
            weak: Weak::clone(&self.weak),
        }
    }
}

impl<T> fmt::Debug for SelfHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfHandle")
            .field("alive", &(self.weak.strong_count() > 0))
            .finish()
    }
}

/// 暴露自身共享引用的能力。
///
/// 内嵌会话的派生类型也可以实现本 trait，从而在自己的方法里拿到 `Arc<Self>`。
pub trait SharedFromThis: Sized {
    fn self_handle(&self) -> &SelfHandle<Self>;

    fn shared_from_this(&self) -> Option<Arc<Self>> {
        self.self_handle().upgrade()
    }

    fn weak_from_this(&self) -> Weak<Self> {
        self.self_handle().downgrade()
    }
}
