use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

/// The logical address of a bus endpoint: a canonical name plus the socket address it listens
///  on. Peers are identified by canonical name; the ordering on names is what resolves
///  simultaneous connects deterministically on both sides (lower name wins).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndPointAddr {
    name: String,
    addr: SocketAddr,
}

impl EndPointAddr {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> EndPointAddr {
        EndPointAddr {
            name: name.into(),
            addr,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Display for EndPointAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}
