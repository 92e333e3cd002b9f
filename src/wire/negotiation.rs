use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::util::safe_converter::PrecheckedCast;
use crate::wire::{PROTOCOL_ID, VERSION_DUAL_IDENTITY, VERSION_IDENTITY, VERSION_RECONNECT};

/// The fixed-size header opening the handshake: both sides send it before reading anything
///  else, proving they speak the same basic protocol before the stream is trusted any further.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiationHeader {
    pub protocol_id: i32,
    pub version_min: i16,
    pub version_max: i16,
    /// peer name length in UTF-16 code units
    pub name_len: u16,
}

impl NegotiationHeader {
    pub const SERIALIZED_LEN: usize = 10;

    pub fn new(version_min: i16, version_max: i16, name: &str) -> NegotiationHeader {
        NegotiationHeader {
            protocol_id: PROTOCOL_ID,
            version_min,
            version_max,
            name_len: name.encode_utf16().count().prechecked_cast(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32(self.protocol_id);
        buf.put_i16(self.version_min);
        buf.put_i16(self.version_max);
        buf.put_u16(self.name_len);
    }

    /// Parse a negotiation header from exactly [`Self::SERIALIZED_LEN`] bytes.
    ///
    /// Very rarely a historical OS defect caused the first byte of a fresh connection to go
    ///  missing. That manifests as the protocol id shifted left by one byte; it is detected
    ///  and corrected here (and only here), in which case the last byte of the input already
    ///  belongs to the following introduction and is handed back to the caller.
    pub fn deser(raw: &[u8; Self::SERIALIZED_LEN]) -> anyhow::Result<(NegotiationHeader, Option<u8>)> {
        let mut buf = &raw[..];
        let protocol_id = buf.get_i32();

        if protocol_id == PROTOCOL_ID {
            let header = NegotiationHeader {
                protocol_id,
                version_min: buf.get_i16(),
                version_max: buf.get_i16(),
                name_len: buf.get_u16(),
            };
            Ok((header, None))
        }
        else if (protocol_id as u32) >> 8 == (PROTOCOL_ID as u32) & 0x00FF_FFFF {
            // first byte of the stream was lost: all fields sit one byte early
            let mut buf = &raw[3..];
            let header = NegotiationHeader {
                protocol_id: PROTOCOL_ID,
                version_min: buf.get_i16(),
                version_max: buf.get_i16(),
                name_len: buf.get_u16(),
            };
            Ok((header, Some(raw[Self::SERIALIZED_LEN - 1])))
        }
        else {
            bail!("incompatible protocol id {:#x}, required {:#x}", protocol_id, PROTOCOL_ID);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectType {
    New = 0,
    Migrate = 1,
}

/// The introduction following a successful negotiation: the canonical endpoint name, and -
///  depending on the negotiated version - the connect type and the connection identities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Introduction {
    pub name: String,
    pub connect_type: ConnectType,
    /// the sender's identity for this logical connection (0 if unknown / not sent)
    pub sender_id: i64,
    /// the receiver's identity as known to the sender (0 if unknown / not sent)
    pub receiver_id: i64,
}

impl Introduction {
    pub fn serialized_len(protocol_version: i16, name_len: u16) -> usize {
        name_len as usize * 2
            + if protocol_version >= VERSION_RECONNECT { 1 } else { 0 }
            + if protocol_version >= VERSION_DUAL_IDENTITY { 16 }
              else if protocol_version >= VERSION_IDENTITY { 8 }
              else { 0 }
    }

    pub fn ser(&self, protocol_version: i16, buf: &mut BytesMut) {
        for unit in self.name.encode_utf16() {
            buf.put_u16(unit);
        }
        if protocol_version >= VERSION_RECONNECT {
            buf.put_u8(self.connect_type as u8);
        }
        if protocol_version >= VERSION_DUAL_IDENTITY {
            buf.put_i64(self.sender_id);
            buf.put_i64(self.receiver_id);
        }
        else if protocol_version >= VERSION_IDENTITY {
            // a single id slot: NEW introduces the sender, MIGRATE names the receiver
            match self.connect_type {
                ConnectType::New => buf.put_i64(self.sender_id),
                ConnectType::Migrate => buf.put_i64(self.receiver_id),
            }
        }
    }

    pub fn deser(protocol_version: i16, name_len: u16, buf: &mut impl Buf) -> anyhow::Result<Introduction> {
        let mut units = Vec::with_capacity(name_len as usize);
        for _ in 0..name_len {
            units.push(buf.try_get_u16()?);
        }
        let name = match String::from_utf16(&units) {
            Ok(name) => name,
            Err(_) => bail!("introduction name is not valid UTF-16"),
        };

        let connect_type = if protocol_version >= VERSION_RECONNECT {
            match ConnectType::try_from(buf.try_get_u8()?) {
                Ok(ct) => ct,
                Err(e) => bail!("invalid connect type {}", e.number),
            }
        }
        else {
            ConnectType::New
        };

        let (sender_id, receiver_id) = if protocol_version >= VERSION_DUAL_IDENTITY {
            (buf.try_get_i64()?, buf.try_get_i64()?)
        }
        else if protocol_version >= VERSION_IDENTITY {
            match connect_type {
                ConnectType::New => (buf.try_get_i64()?, 0),
                ConnectType::Migrate => (0, buf.try_get_i64()?),
            }
        }
        else {
            (0, 0)
        };

        Ok(Introduction {
            name,
            connect_type,
            sender_id,
            receiver_id,
        })
    }
}
