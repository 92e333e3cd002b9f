//! The per-transport handshake: NEGOTIATE -> INTRODUCE -> ACCEPT, with ABANDON as the
//!  terminal for lost connection races and rejected migrations.
//!
//! Each fresh transport runs exactly one handshake before any message bytes flow. The
//!  initiating side knows which logical connection the transport is for; the accepting side
//!  learns it from the peer's introduction and resolves it against the bus state (a fresh
//!  connection, a migration onto an existing one, or a simultaneous-connect collision). Only
//!  after the final accept byte is received is the transport handed over as the connection's
//!  live channel.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::end_point::EndPointAddr;
use crate::error::BusError;
use crate::transport::BoxTransport;
use crate::wire::negotiation::{ConnectType, Introduction, NegotiationHeader};
use crate::wire::{VERSION_MAX, VERSION_MIN};

/// byte sent to finalize the handshake; its value is meaningless, only its arrival matters
const ACCEPT_BYTE: u8 = 0;

fn io_fault(e: std::io::Error) -> BusError {
    BusError::Transport(format!("handshake I/O failure: {}", e))
}

async fn write_negotiation(transport: &mut BoxTransport, local: &EndPointAddr) -> Result<(), BusError> {
    let mut buf = BytesMut::with_capacity(NegotiationHeader::SERIALIZED_LEN);
    NegotiationHeader::new(VERSION_MIN, VERSION_MAX, local.name()).ser(&mut buf);
    transport.write_all(&buf).await.map_err(io_fault)
}

/// read and validate the peer's negotiation header; returns the header, the selected common
///  version and a possible carry-over byte from the corrected one-byte-shift artifact
async fn read_negotiation(transport: &mut BoxTransport) -> Result<(NegotiationHeader, i16, Option<u8>), BusError> {
    let mut raw = [0u8; NegotiationHeader::SERIALIZED_LEN];
    transport.read_exact(&mut raw).await.map_err(io_fault)?;

    let (header, carry) = NegotiationHeader::deser(&raw)
        .map_err(|e| BusError::Protocol(e.to_string()))?;

    if header.version_min > VERSION_MAX || header.version_max < VERSION_MIN {
        return Err(BusError::Protocol(format!(
            "unsupported protocol version range ({}..{}), supported ({}..{})",
            header.version_min, header.version_max, VERSION_MIN, VERSION_MAX)));
    }

    let version = VERSION_MAX.min(header.version_max);
    Ok((header, version, carry))
}

async fn read_introduction(
    transport: &mut BoxTransport,
    version: i16,
    name_len: u16,
    carry: Option<u8>,
) -> Result<Introduction, BusError> {
    let total = Introduction::serialized_len(version, name_len);
    let mut raw = vec![0u8; total];
    let mut filled = 0;
    if let Some(byte) = carry {
        raw[0] = byte;
        filled = 1;
    }
    transport.read_exact(&mut raw[filled..]).await.map_err(io_fault)?;

    Introduction::deser(version, name_len, &mut &raw[..])
        .map_err(|e| BusError::Protocol(format!("malformed introduction: {}", e)))
}

async fn write_introduction(transport: &mut BoxTransport, version: i16, intro: &Introduction) -> Result<(), BusError> {
    let mut buf = BytesMut::new();
    intro.ser(version, &mut buf);
    transport.write_all(&buf).await.map_err(io_fault)
}

async fn exchange_accept(transport: &mut BoxTransport, write_first: bool) -> Result<(), BusError> {
    if write_first {
        transport.write_all(&[ACCEPT_BYTE]).await.map_err(io_fault)?;
        let mut byte = [0u8; 1];
        transport.read_exact(&mut byte).await.map_err(io_fault)?;
    }
    else {
        let mut byte = [0u8; 1];
        transport.read_exact(&mut byte).await.map_err(io_fault)?;
        transport.write_all(&[ACCEPT_BYTE]).await.map_err(io_fault)?;
    }
    Ok(())
}

/// a completed handshake: the transport is ready to carry message traffic
pub struct Handshaken {
    pub transport: BoxTransport,
    pub protocol_version: i16,
    pub peer_intro: Introduction,
}

/// Run the initiating side of the handshake. `intro` carries the local canonical name, the
///  connect type (NEW or MIGRATE) and the connection identities as far as they are known.
pub async fn initiate(
    mut transport: BoxTransport,
    local: &EndPointAddr,
    peer: &EndPointAddr,
    intro: Introduction,
) -> Result<Handshaken, BusError> {
    write_negotiation(&mut transport, local).await?;
    let (peer_header, version, carry) = read_negotiation(&mut transport).await?;
    trace!("{} negotiated protocol version {} with {}", local, version, peer);

    write_introduction(&mut transport, version, &intro).await?;
    let peer_intro = read_introduction(&mut transport, version, peer_header.name_len, carry).await?;

    if peer_intro.name != peer.name() {
        // deliberately permissive: the peer answers under a different canonical name than we
        //  addressed it by. Logged and accepted; the connection continues under the requested
        //  name.
        warn!("{} connected to {} but peer introduced itself as '{}'", local, peer, peer_intro.name);
    }

    // the accepting side sends its accept together with its introduction; answer it
    exchange_accept(&mut transport, true).await?;

    debug!("{} handshake with {} complete (version {}, {:?})", local, peer, version, intro.connect_type);
    Ok(Handshaken {
        transport,
        protocol_version: version,
        peer_intro,
    })
}

/// The accepting side, paused after the peer's introduction: the bus resolves what the
///  introduction means (new connection, migration, collision) and then either accepts or
///  abandons.
pub struct InboundIntroduced {
    transport: BoxTransport,
    pub protocol_version: i16,
    pub peer_intro: Introduction,
}

/// Run the accepting side of the handshake up to and including the peer's introduction.
pub async fn accept_inbound(
    mut transport: BoxTransport,
    local: &EndPointAddr,
) -> Result<InboundIntroduced, BusError> {
    write_negotiation(&mut transport, local).await?;
    let (peer_header, version, carry) = read_negotiation(&mut transport).await?;

    let peer_intro = read_introduction(&mut transport, version, peer_header.name_len, carry).await?;
    trace!("{} inbound introduction from '{}' ({:?}, version {})",
        local, peer_intro.name, peer_intro.connect_type, version);

    Ok(InboundIntroduced {
        transport,
        protocol_version: version,
        peer_intro,
    })
}

impl InboundIntroduced {
    /// accept the connection: send our introduction and accept byte, await the peer's accept
    pub async fn accept(mut self, reply: Introduction) -> Result<Handshaken, BusError> {
        write_introduction(&mut self.transport, self.protocol_version, &reply).await?;
        exchange_accept(&mut self.transport, false).await?;

        Ok(Handshaken {
            transport: self.transport,
            protocol_version: self.protocol_version,
            peer_intro: self.peer_intro,
        })
    }

    /// Abandon the connection without rejecting it outright: wait for the peer to realize the
    ///  collision and close its end, so the peer never sees a close it could mistake for a
    ///  disconnect of its surviving connection. Any data received while abandoned is a
    ///  protocol violation.
    pub async fn abandon(mut self) {
        let mut buf = [0u8; 64];
        match self.transport.read(&mut buf).await {
            Ok(0) => trace!("abandoned handshake closed by peer"),
            Ok(n) => warn!("protocol violation: {} byte(s) received on abandoned handshake", n),
            Err(e) => trace!("abandoned handshake closed: {}", e),
        }
        // dropping the transport closes it
    }
}
