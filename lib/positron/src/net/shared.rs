use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Transport identifiers. An operation id (ioid) is allocated by the client
/// and a channel server id (sid) by the server; both are unique within one
/// transport for their lifetime.
pub type Ioid = u32;
pub type Sid = u32;
pub type Cid = u32;

pub const INVALID_IOID: Ioid = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// No progress right now (receive timeout); the caller re-checks
    /// liveness and retries.
    Yield,
    /// Orderly connection shutdown; workers leave their loops quietly.
    Closed,
    /// The receive watchdog expired; treated like an I/O failure.
    Timeout,
    /// Buffer capacity exhausted.
    Overflow,
    /// Socket failure. Always fatal for the owning transport.
    Io(io::ErrorKind),
    /// Peer violated the protocol; the transport is torn down.
    InvalidStream(&'static str),
    /// Caller asked for something the codec cannot do; the connection
    /// stays healthy.
    InvalidArgument(String),
}

impl NetError {
    /// Whether the owning transport must be torn down.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        match self {
            NetError::Yield | NetError::InvalidArgument(_) => false,
            _ => true,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> NetError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NetError::Yield,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => NetError::Closed,
            kind => NetError::Io(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_folding() {
        let yield_err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(yield_err, NetError::Yield);
        assert!(!yield_err.is_fatal());

        let closed: NetError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(closed, NetError::Closed);
        assert!(closed.is_fatal());

        let other: NetError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(other, NetError::Io(io::ErrorKind::PermissionDenied));
        assert!(other.is_fatal());
    }

    #[test]
    fn test_invalid_argument_is_recoverable() {
        assert!(!NetError::InvalidArgument("too big".to_owned()).is_fatal());
        assert!(NetError::InvalidStream("bad magic").is_fatal());
    }
}
