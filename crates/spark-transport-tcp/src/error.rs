use std::io;

use spark_client::ClientError;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "spark.transport.tcp.resolve_failed",
    message: "tcp resolve",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.tcp.configure_failed",
    message: "tcp configure",
};

/// 将 IO 错误映射为针对某个地址的建连失败。
pub(crate) fn map_io_error(kind: OperationKind, address: &str, error: &io::Error) -> ClientError {
    ClientError::connection(address, format!("{}: {} [{}]", kind.message, error, kind.code))
}

/// 构造不携带 IO 错误的建连失败。
pub(crate) fn operation_error(kind: OperationKind, address: &str, detail: &str) -> ClientError {
    ClientError::connection(address, format!("{}: {} [{}]", kind.message, detail, kind.code))
}

/// 该错误是否可能在短暂等待后自行消失，仅用于日志分级。
pub(crate) fn is_transient(error: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrInUse
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_operation_code_and_address() {
        let err = map_io_error(
            CONNECT,
            "10.0.0.1:80",
            &io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(err.code(), "spark.client.subconn.connect_failed");
        let rendered = err.to_string();
        assert!(rendered.contains("10.0.0.1:80"), "{rendered}");
        assert!(rendered.contains("spark.transport.tcp.connect_failed"), "{rendered}");
    }

    #[test]
    fn refusal_is_transient_but_permission_is_not() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
