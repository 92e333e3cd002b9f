//! Wire-level structs with `ser`/`deser` pairs. All numbers are big-endian; layouts are gated
//!  on the negotiated protocol version where they changed over time.

pub mod control_messages;
pub mod frame_header;
pub mod negotiation;

/// Identifies this protocol family on the wire; the very first bytes exchanged on a fresh
///  transport. A stream that does not start with this value is not a peer bus.
pub const PROTOCOL_ID: i32 = 0x4D42_5553;

/// lowest protocol version this implementation can speak
pub const VERSION_MIN: i16 = 0;

/// highest protocol version this implementation can speak
// version 1 adds reconnect support
// version 2 adds identity
// version 3 adds the sync command byte (request of a remote diagnostic dump)
// version 4 sends local and peer id for MIGRATE, and pads an id spot for NEW
// version 5 widens the message size to i64 and adds header/body checksums
pub const VERSION_MAX: i16 = 5;

pub const VERSION_RECONNECT: i16 = 1;
pub const VERSION_IDENTITY: i16 = 2;
pub const VERSION_SYNC_CMD: i16 = 3;
pub const VERSION_DUAL_IDENTITY: i16 = 4;
pub const VERSION_CRC_FRAMES: i16 = 5;

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// CRC-32 over a sequence of byte slices. A computed value of 0 is mapped to 1 because 0 is
///  reserved on the wire for 'checksum not present'.
pub fn checksum<'a>(segments: impl IntoIterator<Item = &'a [u8]>) -> i32 {
    let mut digest = CRC.digest();
    for segment in segments {
        digest.update(segment);
    }
    let raw = digest.finalize() as i32;
    if raw == 0 { 1 } else { raw }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_matches_known_value() {
        // CRC-32/ISO-HDLC of "123456789"
        assert_eq!(checksum([b"123456789".as_slice()]), 0xCBF43926u32 as i32);
    }

    #[test]
    fn test_checksum_segmented_equals_contiguous() {
        let whole = checksum([b"hello world".as_slice()]);
        let split = checksum([b"hello ".as_slice(), b"world".as_slice()]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_checksum_never_zero() {
        // the empty digest is a fixed value; just pin the 0 -> 1 mapping contract
        assert_ne!(checksum([b"".as_slice()]), 0);
    }
}
