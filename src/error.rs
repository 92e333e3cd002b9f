use std::fmt::{Display, Formatter};

/// Classification of connection-level faults. The class decides the routing: protocol and
///  out-of-sync faults force a disconnect, transport and integrity faults are eligible for
///  connection migration, security faults are never migrated.
///
/// Resource/usage errors (double dispose, invalid state transitions) are deliberately *not*
///  represented here - they are programming errors and surface as panics via assertions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusError {
    /// incompatible protocol id / version, malformed introduction, or data after abandon
    Protocol(String),
    /// I/O failure on the underlying transport
    Transport(String),
    /// header or body checksum mismatch - treated like a transport fault
    Integrity(String),
    /// failure in the transport's security layer - never migrated
    Security(String),
    /// impossible acknowledgement counts after a migration
    OutOfSync(String),
}

impl BusError {
    /// true iff a connection experiencing this fault may migrate to a fresh transport
    ///  instead of disconnecting
    pub fn is_migration_eligible(&self) -> bool {
        matches!(self, BusError::Transport(_) | BusError::Integrity(_))
    }

    pub fn transport_from(e: &std::io::Error) -> BusError {
        BusError::Transport(e.to_string())
    }
}

impl Display for BusError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            BusError::Transport(msg) => write!(f, "transport fault: {}", msg),
            BusError::Integrity(msg) => write!(f, "integrity fault: {}", msg),
            BusError::Security(msg) => write!(f, "security fault: {}", msg),
            BusError::OutOfSync(msg) => write!(f, "out of sync: {}", msg),
        }
    }
}

impl std::error::Error for BusError {}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::protocol(BusError::Protocol("x".to_string()), false)]
    #[case::transport(BusError::Transport("x".to_string()), true)]
    #[case::integrity(BusError::Integrity("x".to_string()), true)]
    #[case::security(BusError::Security("x".to_string()), false)]
    #[case::out_of_sync(BusError::OutOfSync("x".to_string()), false)]
    fn test_migration_eligibility(#[case] error: BusError, #[case] expected: bool) {
        assert_eq!(error.is_migration_eligible(), expected);
    }
}
