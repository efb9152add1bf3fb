use std::io;

use rustls::{AlertDescription, Error as RustlsError};
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const BIND: OperationKind = OperationKind {
    code: "spark.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub const READ: OperationKind = OperationKind {
    code: "spark.transport.tcp.read_failed",
    message: "tcp read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "spark.transport.tcp.write_failed",
    message: "tcp write",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.tcp.configure_failed",
    message: "tcp configure",
};
pub const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.transport.tls.handshake_failed",
    message: "tls handshake",
};
pub const TLS_SETUP: OperationKind = OperationKind {
    code: "spark.transport.tls.setup_failed",
    message: "tls setup",
};

const ABORTED_CODE: &str = "spark.transport.tcp.aborted";
const SHORT_TRANSFER_CODE: &str = "spark.transport.tcp.short_transfer";

/// 传输错误的粗粒度分类，决定会话层的处置方式。
///
/// # 教案级注释
///
/// - **意图（Why）**：会话只关心“这是对端正常离开，还是需要告警的故障”，
///   不应该去解析 `io::ErrorKind` 或 `rustls::Error` 的细节；
/// - **契约（What）**：
///   - `Disconnect` 恰好对应“对端 EOF”与“连接被重置”两种情况，会话对其静默关闭；
///   - `Aborted` 表示本端在操作挂起期间关闭了传输，是关闭流程的副产物而非故障；
///   - 其余分类都会经由会话的错误通知上报。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 对端关闭或重置连接。
    Disconnect,
    /// 本端关闭导致挂起操作被中止。
    Aborted,
    /// 操作超时。
    Timeout,
    /// 证书、握手完整性等安全类失败。
    Security,
    /// 配置缺失或不合法（例如未设置 TLS 参数、密钥文件不可读）。
    Configuration,
    /// 其他传输层失败。
    Transport,
}

/// 传输层错误：稳定错误码 + 分类 + 底层 `io::Error`。
#[derive(Debug, Error)]
#[error("{}: {}", .operation, .source)]
pub struct TransportError {
    code: &'static str,
    operation: &'static str,
    category: ErrorCategory,
    #[source]
    source: io::Error,
}

impl TransportError {
    /// 将 IO 错误映射为传输错误，并附带错误分类。
    pub fn from_io(kind: OperationKind, error: io::Error) -> Self {
        let category = categorize_with_rustls(&error);
        Self {
            code: kind.code,
            operation: kind.message,
            category,
            source: error,
        }
    }

    /// 本端关闭导致操作中止。
    pub fn aborted(kind: OperationKind) -> Self {
        Self {
            code: ABORTED_CODE,
            operation: kind.message,
            category: ErrorCategory::Aborted,
            source: io::Error::new(io::ErrorKind::ConnectionAborted, "transport closed locally"),
        }
    }

    /// 要求精确字节数的读写只完成了一部分。
    pub fn short_transfer(kind: OperationKind, expected: usize, actual: usize) -> Self {
        Self {
            code: SHORT_TRANSFER_CODE,
            operation: kind.message,
            category: ErrorCategory::Transport,
            source: io::Error::new(
                io::ErrorKind::WriteZero,
                format!("transferred {actual} of {expected} bytes"),
            ),
        }
    }

    /// 对端在读操作中发送 FIN。
    pub fn end_of_stream(kind: OperationKind) -> Self {
        Self::from_io(
            kind,
            io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the stream"),
        )
    }

    /// 在尚未建立连接的传输上执行 I/O。
    pub(crate) fn not_connected(kind: OperationKind) -> Self {
        Self::from_io(
            kind,
            io::Error::new(io::ErrorKind::NotConnected, "transport has no stream"),
        )
    }

    /// TLS 配置类失败：参数缺失、密钥材料不可读、证书不被接受等。
    pub(crate) fn configuration(kind: OperationKind, error: io::Error) -> Self {
        Self {
            code: kind.code,
            operation: kind.message,
            category: ErrorCategory::Configuration,
            source: error,
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// 是否为对端断开（EOF 或连接重置）。
    pub fn is_disconnect(&self) -> bool {
        self.category == ErrorCategory::Disconnect
    }

    /// 是否由本端关闭引起。
    pub fn is_aborted(&self) -> bool {
        self.category == ErrorCategory::Aborted
    }

    /// 底层 IO 错误。
    pub fn io_error(&self) -> &io::Error {
        &self.source
    }
}

fn categorize_with_rustls(error: &io::Error) -> ErrorCategory {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return categorize_rustls_error(rustls_error);
    }
    categorize_io_error(error)
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset => ErrorCategory::Disconnect,
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::PermissionDenied | ErrorKind::Unsupported => ErrorCategory::Configuration,
        _ => ErrorCategory::Transport,
    }
}

fn categorize_rustls_error(error: &RustlsError) -> ErrorCategory {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord
        | NoCertificatesPresented
        | InvalidCertificate(_)
        | UnsupportedNameType
        | NoApplicationProtocol => ErrorCategory::Security,
        InconsistentKeys(_) => ErrorCategory::Configuration,
        AlertReceived(alert) => alert_to_category(alert),
        _ => ErrorCategory::Transport,
    }
}

fn alert_to_category(alert: &AlertDescription) -> ErrorCategory {
    use AlertDescription::*;
    match alert {
        CloseNotify => ErrorCategory::Disconnect,
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateRequired
        | AccessDenied
        | DecryptError
        | HandshakeFailure
        | IllegalParameter
        | BadRecordMac
        | InsufficientSecurity
        | ProtocolVersion => ErrorCategory::Security,
        _ => ErrorCategory::Transport,
    }
}
