use thiserror::Error;

/// 会话的使用错误：调用方违反了调用契约，请求被拒绝且会话状态不受影响。
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// 上一次 `write_all` 尚未完成。
    ///
    /// - **意图（Why）**：会话同一时刻只允许一个写操作在途；重叠写既不排队也不合并，
    ///   而是显式拒绝，调用方应等待写完成通知后再发起下一次写。
    #[error("a write is already in flight")]
    WriteInFlight,
    /// 上一次读取尚未完成，读缓冲区仍借给在途操作。
    #[error("a read is already in flight")]
    ReadInFlight,
    /// 读取长度为 0 或超过读缓冲区容量。
    #[error("invalid read size {requested} (buffer capacity {capacity})")]
    InvalidReadSize { requested: usize, capacity: usize },
}

/// 客户端使用错误。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// 地址不是合法的 IP 字面量。
    #[error("invalid address `{address}`")]
    InvalidAddress { address: String },
}
