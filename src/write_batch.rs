//! Outbound buffering: per-connection batches of pending output and the chain tying them
//!  together.
//!
//! A [`WriteBatch`] is a sequence of segments, each a buffer plus a typed receipt slot, with
//!  three cursors moving strictly forward through it: `added` (implicit, the segment count),
//!  `sent` (handed to the transport, with a byte offset for partially written segments) and
//!  `acked` (confirmed by the peer). The [`WriteChain`] is an explicit queue of batches that
//!  serves double duty: it is the *send queue*, advanced by writing, and the *resend queue*,
//!  advanced only by acknowledgements. The two positions normally coincide; after a
//!  connection migration the send position is rewound to the acknowledged position so
//!  unconfirmed bytes are retransmitted, and the send head may then briefly run *behind*
//!  acknowledgements arriving for the original transmission.

use std::collections::VecDeque;
use bytes::Bytes;
use tracing::warn;

use crate::event::Receipt;

/// What the acknowledgement of a segment means. Slots are interleaved with the buffers so
///  that receipt processing can recover message boundaries without separate bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptSlot {
    /// no boundary: the segment is a frame header or continuation inside a message
    None,
    /// frame header whose buffer is released on acknowledgement; no message boundary
    HeaderRecycle,
    /// last segment of a message that carries no application receipt
    MsgMarker,
    /// a receipt control frame that asked the peer for acknowledgements
    AckRequest,
    /// artificial receipt injected to bound resend-queue growth: consumes a returned
    ///  acknowledgement like a real receipt but is never emitted to the application
    NoEmit,
    /// application receipt: consumes a returned acknowledgement and is emitted
    Emit(Receipt),
}

impl ReceiptSlot {
    /// slots that advance the delivered-message count used by migration SYNC arithmetic
    fn is_message_boundary(&self) -> bool {
        !matches!(self, ReceiptSlot::None | ReceiptSlot::HeaderRecycle)
    }

    /// slots the peer answers with a returned acknowledgement count
    fn consumes_returned_ack(&self) -> bool {
        matches!(self, ReceiptSlot::NoEmit | ReceiptSlot::Emit(_))
    }
}

#[derive(Debug)]
struct Segment {
    data: Bytes,
    receipt: ReceiptSlot,
}

/// outcome of appending a message, for the caller's flow-control accounting
#[derive(Debug, PartialEq, Eq)]
pub struct AppendOutcome {
    /// a receipt (real or injected) was recorded; the peer must be told via the next
    ///  receipt control frame
    pub receipt_requested: bool,
    /// bytes newly counted against the unacknowledged window
    pub unacked_delta: usize,
    /// bytes newly queued for sending
    pub queued_delta: usize,
}

#[derive(Debug)]
pub struct WriteBatch {
    segments: Vec<Segment>,
    /// index of the first segment not yet fully written
    sent: usize,
    /// bytes of `segments[sent]` already written
    sent_partial: usize,
    /// index of the first unacknowledged segment
    acked: usize,
    /// bytes in this batch not yet written
    unsent_bytes: usize,
    /// false only for the migration SYNC batch, which is sent but never resent or acked
    resendable: bool,
}

impl WriteBatch {
    pub fn new() -> WriteBatch {
        WriteBatch {
            segments: Vec::new(),
            sent: 0,
            sent_partial: 0,
            acked: 0,
            unsent_bytes: 0,
            resendable: true,
        }
    }

    /// a batch holding exactly the given control frame, pre-acknowledged so it neither
    ///  accepts bundles nor takes part in acknowledgement processing
    pub fn for_sync(frame: Bytes) -> WriteBatch {
        let unsent_bytes = frame.len();
        WriteBatch {
            segments: vec![Segment { data: frame, receipt: ReceiptSlot::None }],
            sent: 0,
            sent_partial: 0,
            acked: 1,
            unsent_bytes,
            resendable: false,
        }
    }

    fn added(&self) -> usize {
        self.segments.len()
    }

    pub fn unsent_bytes(&self) -> usize {
        self.unsent_bytes
    }

    pub fn is_fully_sent(&self) -> bool {
        self.sent == self.added()
    }

    pub fn is_fully_acked(&self) -> bool {
        self.acked == self.added()
    }

    /// `acked <= sent <= added`, suspended transiently between a migration rewind and the
    ///  arrival of acknowledgements for the original transmission
    #[cfg(test)]
    fn assert_cursor_invariant(&self) {
        assert!(self.sent <= self.added());
        assert!(self.acked <= self.added());
    }

    /// Append one message: a frame header segment plus an optional body segment, with the
    ///  receipt slot on the message's last segment. An artificial never-emitted receipt is
    ///  injected for the first receipt-less message of a batch so that even receipt-free
    ///  traffic is periodically acknowledged and the resend queue stays bounded.
    pub fn append_message(&mut self, header: Bytes, body: Option<Bytes>, receipt: Option<Receipt>) -> AppendOutcome {
        let was_empty = self.unsent_bytes == 0;
        let header_len = header.len();
        let body_len = body.as_ref().map(|b| b.len()).unwrap_or(0);

        let effective = match receipt {
            Some(r) => Some(ReceiptSlot::Emit(r)),
            None if was_empty && body.is_some() => Some(ReceiptSlot::NoEmit),
            None => None,
        };
        let receipt_requested = matches!(effective, Some(ReceiptSlot::Emit(_)) | Some(ReceiptSlot::NoEmit));

        match body {
            Some(body) => {
                self.segments.push(Segment { data: header, receipt: ReceiptSlot::HeaderRecycle });
                self.segments.push(Segment {
                    data: body,
                    receipt: effective.unwrap_or(ReceiptSlot::MsgMarker),
                });
            }
            None => {
                self.segments.push(Segment {
                    data: header,
                    receipt: effective.unwrap_or(ReceiptSlot::MsgMarker),
                });
            }
        }

        self.unsent_bytes += header_len + body_len;

        AppendOutcome {
            receipt_requested,
            // frame headers don't count against the unacknowledged window
            unacked_delta: body_len,
            queued_delta: header_len + body_len,
        }
    }

    /// append a receipt control frame; `ack_request` iff it asks the peer for acknowledgements
    pub fn append_control(&mut self, frame: Bytes, ack_request: bool) -> usize {
        let len = frame.len();
        self.segments.push(Segment {
            data: frame,
            receipt: if ack_request { ReceiptSlot::AckRequest } else { ReceiptSlot::MsgMarker },
        });
        self.unsent_bytes += len;
        len
    }

    /// Coalesce the next batch's pending segments into this one. The source must not have
    ///  been partially sent unless it was rewound (cursors equal), which is guaranteed by the
    ///  chain only bundling batches behind the send head.
    pub fn bundle(&mut self, mut source: WriteBatch) {
        debug_assert!(source.sent == 0 || source.sent == source.acked || source.acked > source.sent);

        let from = source.sent.min(source.acked);
        let pre_acked = source.acked.saturating_sub(source.sent);
        if pre_acked > 0 {
            // the source carries acknowledgements for segments not yet resent, so this batch
            //  must already be fully acknowledged and the prefix property is preserved
            debug_assert!(self.is_fully_acked());
            self.acked = self.added() + pre_acked;
        }

        self.segments.extend(source.segments.drain(from..));
        self.unsent_bytes += source.unsent_bytes;
    }

    /// the pending byte slices of this batch, for a gathering write
    fn collect_unsent(&self, out: &mut Vec<Bytes>, mut slots: usize) -> usize {
        for (i, seg) in self.segments.iter().enumerate().skip(self.sent) {
            if slots == 0 {
                break;
            }
            let offset = if i == self.sent { self.sent_partial } else { 0 };
            if offset < seg.data.len() {
                out.push(seg.data.slice(offset..));
                slots -= 1;
            }
        }
        slots
    }

    /// advance the sent cursor by the given number of bytes actually written
    fn advance_sent(&mut self, mut bytes: usize) -> usize {
        while bytes > 0 && self.sent < self.added() {
            let seg_len = self.segments[self.sent].data.len();
            let remaining = seg_len - self.sent_partial;
            if bytes >= remaining {
                bytes -= remaining;
                self.unsent_bytes -= remaining;
                self.sent += 1;
                self.sent_partial = 0;
            }
            else {
                self.sent_partial += bytes;
                self.unsent_bytes -= bytes;
                bytes = 0;
            }
        }
        bytes
    }

    /// Consume acknowledgements from the acked cursor. Each returned count consumes
    ///  everything up to and including the next receipt-consuming slot; message boundaries
    ///  passed along the way are counted for the delivered-out statistic.
    ///
    /// An acknowledgement may arrive for a segment not yet (re)sent - the peer received the
    ///  original transmission before the migration. The segment stays queued (the peer was
    ///  told via SYNC how many messages will be redelivered) and, since segments are
    ///  immutable, it can be retransmitted as-is.
    fn ack(&mut self, returned: &mut i32, emitted: &mut Vec<Receipt>) -> u64 {
        let mut messages = 0u64;
        while self.acked < self.added() && *returned > 0 {
            let slot = std::mem::replace(&mut self.segments[self.acked].receipt, ReceiptSlot::None);

            if slot.is_message_boundary() {
                messages += 1;
            }
            if slot.consumes_returned_ack() {
                *returned -= 1;
            }
            if let ReceiptSlot::Emit(receipt) = slot {
                emitted.push(receipt);
            }

            if self.acked < self.sent {
                // fully sent: the buffer can be released right away
                self.segments[self.acked].data = Bytes::new();
            }
            self.acked += 1;
        }
        messages
    }

    /// Rewind after a migration: everything unacknowledged is retransmitted. Returns the
    ///  change in queued bytes (positive for re-queued sent-but-unacked data, negative when a
    ///  previous rewind left acknowledged segments pending that can now be skipped).
    pub fn rewind(&mut self) -> i64 {
        let old_unsent = self.unsent_bytes as i64;
        self.sent = self.acked;
        self.sent_partial = 0;
        self.unsent_bytes = self.segments[self.acked..].iter().map(|s| s.data.len()).sum();
        self.unsent_bytes as i64 - old_unsent
    }
}

/// result of acknowledgment processing on the chain
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// application receipts to emit, in submission order
    pub emitted: Vec<Receipt>,
    /// message boundaries confirmed - feeds the delivered-out counter
    pub delivered_messages: u64,
}

pub struct WriteChain {
    batches: VecDeque<WriteBatch>,
    /// index of the send head: the first batch with unsent data. Batches in front of it are
    ///  fully sent and kept only until fully acknowledged (the resend queue).
    send_pos: usize,
    /// true while the last batch still accepts appends from application threads
    open_tail: bool,
}

impl WriteChain {
    /// bound on the segment count of a single gathering write
    const MAX_GATHER_SEGMENTS: usize = 64;

    pub fn new() -> WriteChain {
        WriteChain {
            batches: VecDeque::new(),
            send_pos: 0,
            open_tail: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn has_unsent(&self) -> bool {
        self.batches.iter().skip(self.send_pos).any(|b| b.unsent_bytes > 0)
    }

    pub fn unsent_bytes(&self) -> usize {
        self.batches.iter().map(|b| b.unsent_bytes).sum()
    }

    /// true iff something was handed to the transport that the peer has not acknowledged -
    ///  the read-health check only expects inbound progress while this holds
    pub fn has_sent_unacked(&self) -> bool {
        self.batches.iter().any(|b| b.resendable && b.acked < b.sent)
    }

    /// true iff the send head runs ahead of the resend head - the transient state after
    ///  acknowledgements caught up with a rewound chain
    #[cfg(test)]
    pub fn send_head_detached(&self) -> bool {
        self.send_pos > 0
    }

    fn open_tail_mut(&mut self) -> &mut WriteBatch {
        if !self.open_tail {
            self.batches.push_back(WriteBatch::new());
            self.open_tail = true;
        }
        self.batches.back_mut().unwrap()
    }

    pub fn append_message(&mut self, header: Bytes, body: Option<Bytes>, receipt: Option<Receipt>) -> AppendOutcome {
        self.open_tail_mut().append_message(header, body, receipt)
    }

    pub fn append_control(&mut self, frame: Bytes, ack_request: bool) -> usize {
        self.open_tail_mut().append_control(frame, ack_request)
    }

    /// close the tail batch: subsequent appends start a fresh batch. This is the flush
    ///  boundary separating what application threads may still touch from what only the
    ///  writer context touches.
    pub fn close_tail(&mut self) {
        self.open_tail = false;
    }

    /// Migration rollback: drop a pending SYNC of a previous migration, rewind every batch so
    ///  unacknowledged data is retransmitted, drop batches that turned out fully acknowledged,
    ///  and reset the send head to the front. Returns the change in queued bytes.
    pub fn rewind_all(&mut self) -> i64 {
        let mut delta = 0i64;

        if let Some(front) = self.batches.front() {
            if !front.resendable {
                delta -= front.unsent_bytes as i64;
                self.batches.pop_front();
            }
        }

        for batch in self.batches.iter_mut() {
            delta += batch.rewind();
        }

        // batches with nothing left to send or ack are done
        while let Some(front) = self.batches.front() {
            if front.is_fully_acked() && front.unsent_bytes == 0 && (self.batches.len() > 1 || !self.open_tail) {
                self.batches.pop_front();
            }
            else {
                break;
            }
        }

        self.send_pos = 0;
        delta
    }

    /// place the migration SYNC frame ahead of everything pending; it is itself neither
    ///  resendable nor ackable. Returns the change in queued bytes.
    pub fn prepend_sync(&mut self, frame: Bytes) -> i64 {
        let delta = frame.len() as i64;
        self.batches.push_front(WriteBatch::for_sync(frame));
        delta
    }

    /// collect pending byte slices starting at the send head, for a gathering write
    pub fn collect_unsent(&self) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut slots = Self::MAX_GATHER_SEGMENTS;
        for batch in self.batches.iter().skip(self.send_pos) {
            slots = batch.collect_unsent(&mut out, slots);
            if slots == 0 {
                break;
            }
        }
        out
    }

    /// advance the send cursors by bytes actually written, moving the send head forward past
    ///  fully sent batches
    pub fn advance_sent(&mut self, mut bytes: usize) {
        while bytes > 0 {
            let Some(batch) = self.batches.get_mut(self.send_pos) else {
                panic!("this is a bug: more bytes written than were queued");
            };
            bytes = batch.advance_sent(bytes);
            if bytes > 0 || (batch.is_fully_sent() && self.send_pos + 1 < self.batches.len()) {
                self.send_pos += 1;
            }
        }
        // skip over batches with nothing to send (e.g. pre-acknowledged by an early ack)
        while self.send_pos + 1 < self.batches.len()
            && self.batches[self.send_pos].is_fully_sent() {
            self.send_pos += 1;
        }
    }

    /// Coalesce small batches behind the send head into it, bounding chain length when many
    ///  small flushes queue up. Never bundles into a fully acknowledged batch (that could
    ///  lose data during a later migration) and never consumes the open tail.
    pub fn bundle_at_send_head(&mut self, bundle_threshold: usize) {
        while self.send_pos + 1 < self.batches.len() {
            let head = &self.batches[self.send_pos];
            if head.unsent_bytes == 0
                || head.unsent_bytes >= bundle_threshold
                || head.is_fully_acked()
                || !head.resendable {
                break;
            }
            if self.send_pos + 2 == self.batches.len() && self.open_tail {
                break;
            }
            let source = self.batches.remove(self.send_pos + 1).unwrap();
            self.batches[self.send_pos].bundle(source);
        }
    }

    /// Process returned acknowledgements from the resend head. Leftover counts with nothing
    ///  left to consume are logged and dropped - the SYNC exchange is where impossible counts
    ///  are treated as fatal.
    pub fn process_ack(&mut self, mut returned: i32) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        let mut pos = 0;
        while returned > 0 && pos < self.batches.len() {
            let batch = &mut self.batches[pos];
            outcome.delivered_messages += batch.ack(&mut returned, &mut outcome.emitted);
            if batch.is_fully_acked() {
                pos += 1;
            }
            else {
                break;
            }
        }

        if returned > 0 {
            warn!("{} returned acknowledgement(s) with no pending receipt - ignoring", returned);
        }

        // release fully acknowledged, fully sent batches from the front
        while let Some(front) = self.batches.front() {
            if front.is_fully_acked() && front.is_fully_sent()
                && (self.batches.len() > 1 || !self.open_tail) {
                self.batches.pop_front();
                self.send_pos = self.send_pos.saturating_sub(1);
            }
            else {
                break;
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn bytes(content: &[u8]) -> Bytes {
        Bytes::copy_from_slice(content)
    }

    fn drain(chain: &mut WriteChain) -> Vec<u8> {
        let slices = chain.collect_unsent();
        let mut out = Vec::new();
        for s in &slices {
            out.extend_from_slice(s);
        }
        chain.advance_sent(out.len());
        out
    }

    #[test]
    fn test_append_injects_noemit_receipt_once_per_batch() {
        let mut batch = WriteBatch::new();

        let first = batch.append_message(bytes(b"H1"), Some(bytes(b"body1")), None);
        assert!(first.receipt_requested, "first receipt-less message gets the injected receipt");

        let second = batch.append_message(bytes(b"H2"), Some(bytes(b"body2")), None);
        assert!(!second.receipt_requested);

        assert_eq!(batch.segments[1].receipt, ReceiptSlot::NoEmit);
        assert_eq!(batch.segments[3].receipt, ReceiptSlot::MsgMarker);
    }

    #[test]
    fn test_append_accounting() {
        let mut batch = WriteBatch::new();
        let outcome = batch.append_message(bytes(b"HH"), Some(bytes(b"bbb")), Some(7));

        assert_eq!(outcome, AppendOutcome {
            receipt_requested: true,
            unacked_delta: 3,
            queued_delta: 5,
        });
        assert_eq!(batch.unsent_bytes(), 5);
    }

    #[test]
    fn test_headerless_control_append() {
        let mut batch = WriteBatch::new();
        batch.append_control(bytes(b"CTRL"), true);
        assert_eq!(batch.segments[0].receipt, ReceiptSlot::AckRequest);
        assert_eq!(batch.unsent_bytes(), 4);
    }

    #[rstest]
    #[case::all_at_once(&[9])]
    #[case::byte_by_byte(&[1, 1, 1, 1, 1, 1, 1, 1, 1])]
    #[case::split_mid_segment(&[3, 6])]
    fn test_advance_sent_partial_writes(#[case] steps: &[usize]) {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"HEAD"), Some(bytes(b"world")), None);
        chain.close_tail();

        let mut written = Vec::new();
        for &step in steps {
            let slices = chain.collect_unsent();
            let flat: Vec<u8> = slices.iter().flat_map(|s| s.iter().cloned()).collect();
            written.extend_from_slice(&flat[..step]);
            chain.advance_sent(step);
        }

        assert_eq!(written, b"HEADworld");
        assert!(!chain.has_unsent());
    }

    #[test]
    fn test_ack_emits_receipts_in_submission_order() {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"A"), Some(bytes(b"1")), Some(100));
        chain.append_message(bytes(b"B"), Some(bytes(b"2")), Some(101));
        chain.append_message(bytes(b"C"), Some(bytes(b"3")), None); // msg marker only
        chain.append_message(bytes(b"D"), Some(bytes(b"4")), Some(102));
        chain.close_tail();
        drain(&mut chain);

        let first = chain.process_ack(2);
        assert_eq!(first.emitted, vec![100, 101]);
        assert_eq!(first.delivered_messages, 2);

        // the third returned ack consumes the marker message along the way
        let second = chain.process_ack(1);
        assert_eq!(second.emitted, vec![102]);
        assert_eq!(second.delivered_messages, 2);

        assert!(chain.is_empty());
    }

    #[test]
    fn test_ack_without_pending_receipt_is_ignored() {
        let mut chain = WriteChain::new();
        let outcome = chain.process_ack(3);
        assert_eq!(outcome, AckOutcome::default());
    }

    #[test]
    fn test_rewind_requeues_unacked_bytes() {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"AA"), Some(bytes(b"11")), Some(1));
        chain.append_message(bytes(b"BB"), Some(bytes(b"22")), Some(2));
        chain.close_tail();

        drain(&mut chain);
        assert!(!chain.has_unsent());

        // first message acked, second unconfirmed when the transport dies
        chain.process_ack(1);

        let delta = chain.rewind_all();
        assert_eq!(delta, 4); // "BB" + "22" requeued

        assert_eq!(drain(&mut chain), b"BB22");
    }

    #[test]
    fn test_rewind_drops_stale_sync_batch() {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"A"), Some(bytes(b"1")), Some(1));
        chain.close_tail();
        chain.prepend_sync(bytes(b"SYNC1"));

        // second migration before the first SYNC went out
        let delta = chain.rewind_all();
        assert_eq!(delta, -(b"SYNC1".len() as i64));
        chain.prepend_sync(bytes(b"SYNC2"));

        assert_eq!(drain(&mut chain), b"SYNC2A1");
    }

    #[test]
    fn test_sync_batch_is_not_ackable() {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"A"), Some(bytes(b"1")), Some(42));
        chain.close_tail();
        chain.prepend_sync(bytes(b"SYNC"));
        drain(&mut chain);

        // the single returned ack must consume the app message, not the sync frame
        let outcome = chain.process_ack(1);
        assert_eq!(outcome.emitted, vec![42]);
        assert_eq!(outcome.delivered_messages, 1);
    }

    #[test]
    fn test_ack_ahead_of_resend_after_double_migration() {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"AA"), Some(bytes(b"11")), Some(1));
        chain.close_tail();
        drain(&mut chain);

        // transport fails; everything unacked is rewound
        assert_eq!(chain.rewind_all(), 4);

        // the ack for the *original* transmission arrives on the new transport before the
        //  resend went out: the receipt is emitted, but the bytes remain queued because the
        //  peer was promised a redelivery
        let outcome = chain.process_ack(1);
        assert_eq!(outcome.emitted, vec![1]);
        assert!(chain.has_unsent());
        assert!(chain.send_head_detached() || chain.batches[0].acked > chain.batches[0].sent);

        assert_eq!(drain(&mut chain), b"AA11");
    }

    #[test]
    fn test_bundle_coalesces_closed_batches() {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"A"), Some(bytes(b"1")), None);
        chain.close_tail();
        chain.append_message(bytes(b"B"), Some(bytes(b"2")), None);
        chain.close_tail();
        chain.append_message(bytes(b"C"), Some(bytes(b"3")), None);
        chain.close_tail();

        chain.bundle_at_send_head(1024);
        assert_eq!(chain.batches.len(), 1);
        assert_eq!(chain.unsent_bytes(), 6);

        assert_eq!(drain(&mut chain), b"A1B2C3");
    }

    #[test]
    fn test_bundle_leaves_open_tail_alone() {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"A"), Some(bytes(b"1")), None);
        chain.close_tail();
        chain.append_message(bytes(b"B"), Some(bytes(b"2")), None); // open tail

        chain.bundle_at_send_head(1024);
        assert_eq!(chain.batches.len(), 2);
    }

    #[test]
    fn test_bundle_does_not_touch_sync_head() {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"A"), Some(bytes(b"1")), None);
        chain.close_tail();
        chain.rewind_all();
        chain.prepend_sync(bytes(b"SYNC"));

        chain.bundle_at_send_head(1024);
        assert_eq!(chain.batches.len(), 2, "the sync batch must never accept bundles");
    }

    #[test]
    fn test_cursor_invariant_across_lifecycle() {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"AA"), Some(bytes(b"11")), Some(1));
        chain.append_message(bytes(b"BB"), Some(bytes(b"22")), None);
        chain.close_tail();
        for b in &chain.batches { b.assert_cursor_invariant(); }

        drain(&mut chain);
        for b in &chain.batches { b.assert_cursor_invariant(); }

        chain.rewind_all();
        for b in &chain.batches { b.assert_cursor_invariant(); }

        chain.process_ack(1);
        drain(&mut chain);
        for b in &chain.batches { b.assert_cursor_invariant(); }
    }

    #[test]
    fn test_open_tail_accepts_appends_after_partial_ack() {
        let mut chain = WriteChain::new();
        chain.append_message(bytes(b"A"), Some(bytes(b"1")), Some(1));
        drain(&mut chain);
        chain.process_ack(1);

        // tail is fully acked but still open - it must survive and accept this append
        chain.append_message(bytes(b"B"), Some(bytes(b"2")), Some(2));
        chain.close_tail();
        assert_eq!(drain(&mut chain), b"B2");

        let outcome = chain.process_ack(1);
        assert_eq!(outcome.emitted, vec![2]);
    }
}
