use thiserror::Error;

/// What a caller is expected to do after an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The current reception was abandoned and counted as dropped. Keep feeding data, the next
    ///  frame starts fresh.
    ResetAndContinue,
    /// The caller passed invalid input or called operations out of order. No state was changed.
    ReportToCaller,
    /// There is no confirmed peer. Keep polling, the connection is re-established automatically.
    RetryLater,
}

#[derive(Debug, Error)]
pub enum TransferError {
    /// The peer sent something that cannot be interpreted: invalid headers, segments that would
    ///  write out of bounds, unknown control messages.
    #[error("wire format error: {0}")]
    WireFormat(String),

    #[error("invalid use: {0}")]
    Misuse(String),

    #[error("not connected")]
    NotConnected,

    /// The external buffer sets provided by the caller cannot hold the incoming frame
    #[error("external buffer error: {0}")]
    ExternalBuffer(String),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::WireFormat(_) => ErrorKind::ResetAndContinue,
            TransferError::ExternalBuffer(_) => ErrorKind::ResetAndContinue,
            TransferError::Misuse(_) => ErrorKind::ReportToCaller,
            TransferError::NotConnected => ErrorKind::RetryLater,
        }
    }

    pub(crate) fn wire(e: anyhow::Error) -> TransferError {
        TransferError::WireFormat(e.to_string())
    }
}
