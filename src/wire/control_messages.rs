use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

use crate::util::safe_converter::PrecheckedCast;
use crate::wire::frame_header::FrameHeader;
use crate::wire::VERSION_SYNC_CMD;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlKind {
    Receipt = 1,
    Sync = 2,
}

pub const SYNC_CMD_NONE: u8 = 0;
/// bit 0: ask the peer for a one-time diagnostic capture because migration appears stuck
pub const SYNC_CMD_DUMP: u8 = 1;

/// Periodically exchanged acknowledgement bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessageReceipt {
    /// number of receipt-requesting messages the sender has flushed since the last receipt
    ///  message; negative demands an immediate acknowledgement flush from the peer
    pub requested: i32,
    /// number of message acknowledgements being returned to the peer
    pub returned: i32,
}

impl ControlMessageReceipt {
    pub const BODY_LEN: usize = 9;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(ControlKind::Receipt as u8);
        buf.put_i32(self.requested);
        buf.put_i32(self.returned);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessageReceipt> {
        Ok(ControlMessageReceipt {
            requested: buf.try_get_i32()?,
            returned: buf.try_get_i32()?,
        })
    }
}

/// Exchanged once per migration to reconcile message counts, so that neither side loses or
///  replays application messages across the transport swap. Not itself resendable or ackable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessageSync {
    /// messages sent by this side that the peer has acknowledged
    pub delivered_out: i64,
    /// messages this side has received from the peer
    pub seen_in: i64,
    /// command bits (v>=3), see SYNC_CMD_*
    pub cmd: u8,
}

impl ControlMessageSync {
    pub fn body_len(protocol_version: i16) -> usize {
        17 + if protocol_version >= VERSION_SYNC_CMD { 1 } else { 0 }
    }

    pub fn ser(&self, protocol_version: i16, buf: &mut BytesMut) {
        buf.put_u8(ControlKind::Sync as u8);
        buf.put_i64(self.delivered_out);
        buf.put_i64(self.seen_in);
        if protocol_version >= VERSION_SYNC_CMD {
            buf.put_u8(self.cmd);
        }
    }

    pub fn deser(protocol_version: i16, buf: &mut impl Buf) -> anyhow::Result<ControlMessageSync> {
        Ok(ControlMessageSync {
            delivered_out: buf.try_get_i64()?,
            seen_in: buf.try_get_i64()?,
            cmd: if protocol_version >= VERSION_SYNC_CMD { buf.try_get_u8()? } else { SYNC_CMD_NONE },
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    Receipt(ControlMessageReceipt),
    Sync(ControlMessageSync),
}

impl ControlMessage {
    /// Parse a complete control frame body (type tag plus fields).
    pub fn deser(protocol_version: i16, buf: &mut impl Buf) -> anyhow::Result<ControlMessage> {
        let tag = buf.try_get_u8()?;
        match ControlKind::try_from(tag) {
            Ok(ControlKind::Receipt) => Ok(ControlMessage::Receipt(ControlMessageReceipt::deser(buf)?)),
            Ok(ControlKind::Sync) => Ok(ControlMessage::Sync(ControlMessageSync::deser(protocol_version, buf)?)),
            Err(_) => bail!("unknown control message type {}", tag),
        }
    }

    fn body_len(&self, protocol_version: i16) -> usize {
        match self {
            ControlMessage::Receipt(_) => ControlMessageReceipt::BODY_LEN,
            ControlMessage::Sync(_) => ControlMessageSync::body_len(protocol_version),
        }
    }

    /// Encode a complete control frame: negative-length header plus body, with checksums
    ///  backfilled when the protocol version carries them.
    pub fn encode_frame(&self, protocol_version: i16, with_crc: bool) -> Bytes {
        let body_len = self.body_len(protocol_version);
        let mut body = BytesMut::with_capacity(body_len);
        match self {
            ControlMessage::Receipt(receipt) => receipt.ser(&mut body),
            ControlMessage::Sync(sync) => sync.ser(protocol_version, &mut body),
        }
        debug_assert_eq!(body.len(), body_len);

        let neg_len: i64 = body_len.prechecked_cast();
        let header = FrameHeader::for_body(-neg_len, with_crc, [body.as_ref()]);

        let mut frame = BytesMut::with_capacity(FrameHeader::serialized_len(protocol_version) + body_len);
        header.ser(protocol_version, &mut frame);
        frame.put_slice(&body);
        frame.freeze()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::plain(3, 5)]
    #[case::forced(-3, 5)]
    #[case::zero(0, 0)]
    fn test_receipt_roundtrip(#[case] requested: i32, #[case] returned: i32) {
        let original = ControlMessage::Receipt(ControlMessageReceipt { requested, returned });

        let mut buf = BytesMut::new();
        if let ControlMessage::Receipt(r) = &original {
            r.ser(&mut buf);
        }
        assert_eq!(buf.len(), ControlMessageReceipt::BODY_LEN);

        let deser = ControlMessage::deser(5, &mut buf.freeze()).unwrap();
        assert_eq!(deser, original);
    }

    #[rstest]
    #[case::v2_no_cmd(2)]
    #[case::v3_cmd(3)]
    #[case::v5_cmd(5)]
    fn test_sync_roundtrip(#[case] version: i16) {
        let original = ControlMessage::Sync(ControlMessageSync {
            delivered_out: 17,
            seen_in: 4,
            cmd: SYNC_CMD_NONE,
        });

        let mut buf = BytesMut::new();
        if let ControlMessage::Sync(s) = &original {
            s.ser(version, &mut buf);
        }
        assert_eq!(buf.len(), ControlMessageSync::body_len(version));

        let deser = ControlMessage::deser(version, &mut buf.freeze()).unwrap();
        assert_eq!(deser, original);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(99);
        buf.put_slice(&[0; 16]);
        assert!(ControlMessage::deser(5, &mut buf.freeze()).is_err());
    }

    #[rstest]
    #[case::legacy(2, false)]
    #[case::crc(5, true)]
    fn test_encode_frame_parses_back(#[case] version: i16, #[case] with_crc: bool) {
        let msg = ControlMessage::Sync(ControlMessageSync {
            delivered_out: 1000,
            seen_in: 999,
            cmd: if version >= VERSION_SYNC_CMD { SYNC_CMD_DUMP } else { SYNC_CMD_NONE },
        });

        let frame = msg.encode_frame(version, with_crc);

        let header_len = FrameHeader::serialized_len(version);
        let header = FrameHeader::deser(version, &frame[..header_len]).unwrap();
        assert!(header.is_control());
        assert_eq!(header.body_len() as usize, frame.len() - header_len);

        let body = &frame[header_len..];
        header.verify_body([body]).unwrap();

        let deser = ControlMessage::deser(version, &mut &body[..]).unwrap();
        assert_eq!(deser, msg);
    }
}
