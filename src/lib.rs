//! A reliable, message-oriented bus built directly on byte-stream sockets: ordered,
//!  at-most-once-per-attempt delivery with transparent reconnection ("migration") that
//!  survives transport failures without losing or duplicating application messages.
//!
//! ## Design goals
//!
//! * Peer-to-peer: every process runs one bus that both accepts and initiates transports;
//!   peers are addressed by canonical name, and there is at most one logical connection per
//!   peer no matter which side connected first
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data), not
//!   streams of bytes; inbound messages are delivered zero-copy as views into pooled read
//!   buffers
//! * A logical connection outlives its socket: when a transport fails, the connection rolls
//!   its send state back to the last acknowledged point, reconnects, and exchanges a SYNC
//!   message so that neither side loses or replays messages
//! * Receipts: a send may carry a receipt token that is returned in an event exactly once,
//!   after the peer has confirmed delivery - in submission order per connection
//! * Small messages are batched; flushing is optimistic (a single compare-and-swap decides
//!   who flushes, losers skip) and never blocks `send` on socket I/O
//! * Backlog signaling with hysteresis instead of blocking: the application is told when a
//!   connection's outbound queue becomes excessive and when it recovers
//! * Explicitly *not* a messaging system with pub/sub, broadcast or multi-hop routing, and
//!   not a security layer - encryption is expected as an opaque transport decorator
//!
//! ## Handshake
//!
//! Every fresh transport negotiates before any message bytes flow (all numbers big-endian):
//!
//! ```ascii
//! NEGOTIATE:  protocol id (i32), min version (i16), max version (i16), name length (i16)
//! INTRODUCE:  canonical name (UTF-16 units), then version-gated:
//!             v1+: connect type (u8): 0 = NEW, 1 = MIGRATE
//!             v2..v3: one identity (i64); v4+: sender and receiver identity (i64 each)
//! ACCEPT:     one (otherwise meaningless) byte per side
//! ```
//!
//! Version ranges must overlap; the selected version is min(local max, peer max).
//! Simultaneous connects are resolved deterministically: the connection initiated by the
//! lexicographically lower canonical name survives, the other side abandons its attempt
//! without a spurious disconnect.
//!
//! ## Message framing
//!
//! ```ascii
//! v4 and below:  length (i32)                    negative length = control message
//! v5 and above:  length (i64), body CRC (i32), header CRC (i32)
//!                header CRC covers the preceding 12 bytes and is validated before the
//!                declared length is trusted; 0 means 'checksum not present'
//! ```
//!
//! Control messages carry a one-byte type tag:
//!
//! ```ascii
//! RECEIPT (1):  requested (i32, negative demands an immediate ack flush), returned (i32)
//! SYNC    (2):  delivered out (i64), seen in (i64), v3+: command bits (u8)
//! ```
//!
//! A checksum failure is treated as a transport fault and routed through migration, not as a
//! fatal protocol error - the bytes were damaged in flight, the peer is fine.
//!
//! ## Migration
//!
//! On an eligible fault the connection closes the failed transport, rewinds its write chain
//! to the acknowledged position, places a SYNC frame ahead of the resend queue and
//! reconnects (with damped retries, up to a configurable attempt cap). The SYNC exchange
//! tells each side how many messages of the incoming resend stream to skip; impossible
//! counts force a disconnect. Security faults never migrate.

pub mod buffers;
pub mod bus;
pub mod config;
pub mod connection;
pub mod end_point;
pub mod error;
pub mod event;
pub mod handshake;
pub mod read_batch;
pub mod test_util;
pub mod transport;
pub mod util;
pub mod wire;
pub mod write_batch;

pub use bus::{BusState, SocketBus};
pub use config::BusConfig;
pub use end_point::EndPointAddr;
pub use error::BusError;
pub use event::{BusEvent, MessagePayload, Receipt};
