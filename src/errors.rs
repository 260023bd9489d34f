use strum_macros::Display;

/// Why a transport-level connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionFailureKind {
    /// TCP connect or DNS resolution failed.
    UnableToConnect,
    /// An established socket reported an IO error.
    SocketFailure,
    /// Authentication was rejected during the handshake.
    AuthFailure,
    /// The inbound byte stream violated RESP framing.
    ProtocolFailure,
    /// The peer closed the socket.
    SocketClosed,
}

/// Which stage of a command's life the deadline expired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TimeoutPhase {
    /// Waiting in the backlog, unsent.
    Backlog,
    /// Written to the wire, awaiting the reply.
    InFlight,
    /// Establishing the connection itself.
    Connect,
}

/// The closed error taxonomy surfaced by every fallible operation.
///
/// `Clone` matters: a dropped connection fans a single failure out to every
/// in-flight sink in FIFO order.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connection failed: {cause}")]
    ConnectionFailed { cause: ConnectionFailureKind },
    #[error("timed out ({phase})")]
    Timeout { phase: TimeoutPhase },
    #[error("server error: {}", String::from_utf8_lossy(.0))]
    Server(Vec<u8>),
    #[error("keys hash to more than one slot")]
    CrossSlot,
    #[error("redirect limit exceeded")]
    TooManyRedirects,
    #[error("no server is available for this operation")]
    NoServerAvailable,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("high-integrity token mismatch")]
    Integrity,
    #[error("multiplexer is closed")]
    MultiplexerClosed,
    #[error("backlog is full")]
    BacklogOverflow,
    #[error("command {0} is not available on this server")]
    CommandNotAvailable(&'static str),
    #[error("transaction aborted: a watched key changed or a precondition failed")]
    TransactionAborted,
    #[error("transaction rejected by the server")]
    TransactionRejected,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn connection(cause: ConnectionFailureKind) -> Error {
        Error::ConnectionFailed { cause }
    }

    pub(crate) fn timeout(phase: TimeoutPhase) -> Error {
        Error::Timeout { phase }
    }

    /// True when the failure means the underlying socket is gone and the
    /// bridge will be reconnecting.
    pub fn is_connection_drop(&self) -> bool {
        matches!(self, Error::ConnectionFailed { .. })
    }

    pub(crate) fn classify_io(err: &std::io::Error) -> ConnectionFailureKind {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
                ConnectionFailureKind::UnableToConnect
            }
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => ConnectionFailureKind::SocketClosed,
            ErrorKind::InvalidData => ConnectionFailureKind::ProtocolFailure,
            _ => ConnectionFailureKind::SocketFailure,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::ConnectionFailed {
            cause: Error::classify_io(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_classification() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(
            Error::classify_io(&refused),
            ConnectionFailureKind::UnableToConnect
        );
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(
            Error::classify_io(&reset),
            ConnectionFailureKind::SocketClosed
        );
    }

    #[test]
    fn display_includes_cause() {
        let err = Error::connection(ConnectionFailureKind::SocketClosed);
        assert_eq!(err.to_string(), "connection failed: SocketClosed");
        assert!(err.is_connection_drop());
    }
}
