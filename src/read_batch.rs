//! Inbound reassembly: turns the connection's byte stream into discrete framed messages.
//!
//! The stream alternates between fixed-size headers and variable-length bodies, tracked by a
//!  two-phase state machine with a required-byte counter (negative while a control-frame body
//!  is pending). Bytes arrive in pooled buffers that are kept exactly as long as some part of
//!  them is unconsumed or referenced by an undisposed message; message bodies are exposed as
//!  zero-copy views into those buffers, one slice per spanned buffer.

use std::collections::VecDeque;
use anyhow::bail;

use crate::buffers::shared_buffer::{SharedBuffer, SharedSlice};
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::frame_header::FrameHeader;

/// an upper bound for control frame bodies, far above any real control message - a declared
///  control length beyond this is stream corruption that slipped past the checksums
const MAX_CONTROL_BODY: i64 = 1024;

/// A completely reassembled frame. Control frames are dispatched internally by the
///  connection; data frames become MESSAGE events.
#[derive(Debug)]
pub struct RawFrame {
    pub control: bool,
    pub segments: Vec<SharedSlice>,
}

impl RawFrame {
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// copy the frame body out; used for the (small) control frames only
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for seg in &self.segments {
            out.extend_from_slice(seg.as_ref());
        }
        out
    }
}

struct ReadBuffer {
    shared: SharedBuffer,
    consumed: usize,
}

impl ReadBuffer {
    fn remaining(&self) -> usize {
        self.shared.len() - self.consumed
    }
}

pub struct ReadBatch {
    protocol_version: i16,
    crc_enabled: bool,
    buffers: VecDeque<ReadBuffer>,
    /// unconsumed bytes across all buffers
    readable: usize,
    /// bytes needed before the next parse step; negative flags a pending control-frame body
    required: i64,
    /// true while the next bytes are a frame header
    in_header: bool,
    /// body checksum declared by the last parsed header
    pending_body_crc: i32,
}

impl ReadBatch {
    pub fn new(protocol_version: i16, crc_enabled: bool) -> ReadBatch {
        ReadBatch {
            protocol_version,
            crc_enabled,
            buffers: VecDeque::new(),
            readable: 0,
            required: FrameHeader::serialized_len(protocol_version) as i64,
            in_header: true,
            pending_body_crc: 0,
        }
    }

    /// no partial frame and no buffered bytes: the batch holds no resources
    pub fn is_idle(&self) -> bool {
        self.readable == 0 && self.in_header
    }

    pub fn readable(&self) -> usize {
        self.readable
    }

    /// hand a freshly filled pool buffer to the reassembly
    pub fn push(&mut self, buf: SharedBuffer) {
        if buf.is_empty() {
            return;
        }
        self.readable += buf.len();
        self.buffers.push_back(ReadBuffer {
            shared: buf,
            consumed: 0,
        });
    }

    /// Produce the next complete frame, or None if more bytes are needed. Errors are
    ///  integrity faults (checksum mismatch) or stream corruption; the caller routes them
    ///  through the migration path.
    pub fn poll(&mut self) -> anyhow::Result<Option<RawFrame>> {
        loop {
            if self.in_header {
                let header_len = FrameHeader::serialized_len(self.protocol_version);
                if self.readable < header_len {
                    return Ok(None);
                }

                let mut scratch = [0u8; FrameHeader::SERIALIZED_LEN_CRC];
                self.copy_out(&mut scratch[..header_len]);
                let header = FrameHeader::deser(self.protocol_version, &scratch[..header_len])?;

                if header.is_control() && header.body_len() > MAX_CONTROL_BODY {
                    bail!("implausible control frame of {} bytes", header.body_len());
                }

                self.consume(header_len);
                self.required = header.length;
                self.pending_body_crc = header.body_crc;
                self.in_header = false;
                // fall through: the body may already be buffered
            }

            let body_len: usize = self.required.abs().prechecked_cast();
            if self.readable < body_len {
                return Ok(None);
            }

            let segments = self.consume_as_slices(body_len);
            if self.crc_enabled && self.pending_body_crc != 0 {
                let header = FrameHeader {
                    length: self.required,
                    body_crc: self.pending_body_crc,
                    header_crc: 0,
                };
                header.verify_body(segments.iter().map(|s| s.as_ref()))?;
            }

            let control = self.required < 0;
            self.in_header = true;
            self.required = FrameHeader::serialized_len(self.protocol_version) as i64;
            self.release_idle();

            return Ok(Some(RawFrame { control, segments }));
        }
    }

    /// copy the next n bytes into `out` without consuming them - headers may span buffers
    fn copy_out(&self, out: &mut [u8]) {
        let mut filled = 0;
        for buf in &self.buffers {
            if filled == out.len() {
                break;
            }
            let available = &buf.shared.as_slice()[buf.consumed..];
            let take = available.len().min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&available[..take]);
            filled += take;
        }
        assert_eq!(filled, out.len(), "this is a bug: copy_out beyond readable bytes");
    }

    fn consume(&mut self, mut n: usize) {
        self.readable -= n;
        while n > 0 {
            let front = self.buffers.front_mut().expect("this is a bug: consume beyond readable bytes");
            let take = front.remaining().min(n);
            front.consumed += take;
            n -= take;
            if front.remaining() == 0 {
                self.buffers.pop_front();
            }
        }
    }

    /// consume the next n bytes as zero-copy views, one per spanned buffer
    fn consume_as_slices(&mut self, mut n: usize) -> Vec<SharedSlice> {
        self.readable -= n;
        let mut segments = Vec::new();
        while n > 0 {
            let front = self.buffers.front_mut().expect("this is a bug: consume beyond readable bytes");
            let take = front.remaining().min(n);
            segments.push(front.shared.slice(front.consumed..front.consumed + take));
            front.consumed += take;
            n -= take;
            if front.remaining() == 0 {
                self.buffers.pop_front();
            }
        }
        segments
    }

    /// drop drained buffers eagerly when between frames
    fn release_idle(&mut self) {
        while let Some(front) = self.buffers.front() {
            if front.remaining() == 0 {
                self.buffers.pop_front();
            }
            else {
                break;
            }
        }
    }
}
