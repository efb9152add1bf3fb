#![deny(unsafe_code)]
#![doc = r#"
# spark-runtime

## 教案式导读

- **意图（Why）**：为连接级状态机提供唯一的并发安全手段。线程池负责“跑任务”，
  [`Strand`] 负责“同一对象的任务不交叠”，[`Timer`] 则把一次性延迟挂到同一个 Strand
  上，使超时与被它约束的操作天然互斥。
- **结构（How）**：
  - [`ThreadPool`] / [`Executor`]：显式构造、显式持有的执行基座，不存在进程级单例；
  - [`Strand`] / [`WeakStrand`]：拥有被串行化的状态 `S`，任务以 `FnOnce(&mut S)` 的形式提交；
  - [`Timer`]：可取消、可重新武装的一次性定时器，触发回调经由所属 Strand 派发。
- **契约（What）**：除构造线程池外，本 crate 的任何操作都不会失败或阻塞调用线程。
"#]

mod executor;
mod strand;
mod timer;

pub use executor::{Executor, RuntimeError, ThreadPool};
pub use strand::{Strand, WeakStrand};
pub use timer::{Timer, TimerError};
