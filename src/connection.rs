//! The per-peer connection: lifecycle state machine, flow-controlled write pipeline, read
//!  dispatch and the migration bookkeeping that lets a logical conversation survive the loss
//!  of its underlying transport.
//!
//! Locking model: all connection state lives behind one mutex (`ConnectionInner`), with a few
//!  designated atomics (queued bytes, unacknowledged bytes, backlog flag, receipts to return)
//!  for lock-free reads across threads. Reads and acknowledgement processing run on the
//!  connection's reader task; application threads call `send`/`flush` concurrently, which is
//!  why the append path takes the mutex. Nothing ever blocks on I/O while holding the mutex:
//!  writers collect byte slices under the lock and perform the socket write outside it,
//!  re-validating the transport epoch afterwards.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::io::IoSlice;

use bytes::{Bytes, BytesMut};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::bus::BusContext;
use crate::buffers::shared_buffer::SharedBuffer;
use crate::end_point::EndPointAddr;
use crate::error::BusError;
use crate::event::{BusEvent, MessagePayload, Receipt};
use crate::handshake;
use crate::read_batch::{RawFrame, ReadBatch};
use crate::transport::BoxTransport;
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::control_messages::{ControlMessage, ControlMessageReceipt, ControlMessageSync, SYNC_CMD_DUMP, SYNC_CMD_NONE};
use crate::wire::frame_header::FrameHeader;
use crate::wire::negotiation::{ConnectType, Introduction};
use crate::wire::VERSION_RECONNECT;
use crate::write_batch::WriteChain;

/// Connection lifecycle. Transitions only ever move forward; FINAL removes the connection
///  from the bus map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// CONNECT event emitted but no usable transport yet
    Open,
    /// a transport is bound, messages flow
    Active,
    /// DISCONNECT event emitted, no more exchanges
    Defunct,
    /// RELEASE event emitted, all done
    Final,
}

struct HealthState {
    bytes_read_last: u64,
    bytes_written_last: u64,
    unhealthy_since: Option<Instant>,
}

struct ConnectionInner {
    state: ConnectionState,
    /// negotiated protocol version, -1 until the first handshake completes
    protocol_version: i16,
    /// the peer's identity for this logical connection, 0 until learned
    peer_id: i64,
    /// bumped whenever the bound transport changes; tasks and in-flight writes carry the
    ///  epoch they were started under and stand down when it is stale
    epoch: u64,
    migrations: u32,
    reconnect_attempts: u32,
    /// consecutive migrations without acknowledgement progress - drives timeout escalation
    ///  and the one-time diagnostic request
    stuck_migrations: u32,
    delivered_at_last_migration: i64,
    ever_activated: bool,
    /// true while a live transport is bound; false between a migration (or fault) and the
    ///  next activation
    transport_bound: bool,
    /// sends buffered before the first activation, when the frame layout is not yet known
    pre_active: Vec<(Bytes, Option<Receipt>)>,
    chain: WriteChain,
    receipts_unflushed: i32,
    /// messages we sent that the peer has acknowledged
    msg_out_delivered: i64,
    /// messages received from the peer (control messages included, SYNC excluded)
    msg_in: i64,
    /// post-migration skip window: inbound messages to discard uncounted
    msg_in_skip: i64,
    reader_task: Option<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    disconnect_cause: Option<BusError>,
    health: HealthState,
}

struct WriterSlot {
    epoch: u64,
    half: Option<WriteHalf<BoxTransport>>,
}

pub struct Connection {
    ctx: Arc<BusContext>,
    peer: EndPointAddr,
    /// process-unique, monotonic, non-zero; identifies this logical connection across
    ///  migrations
    local_id: i64,
    /// true iff created by a local connect(): this side runs reconnects during migration
    initiator: bool,
    inner: Mutex<ConnectionInner>,
    writer: Arc<tokio::sync::Mutex<WriterSlot>>,
    writer_wake: Arc<Notify>,
    /// unsent bytes across the chain; the backlog signal
    queued_bytes: AtomicI64,
    /// body bytes sent since the last acknowledgement; drives forced-ack requests
    unacked_bytes: AtomicI64,
    /// acknowledgements owed to the peer, accumulated until the next flush
    receipts_to_return: AtomicI32,
    /// optimistic flush guard: at most one flush in progress
    flushing: AtomicBool,
    backlog_excessive: AtomicBool,
    concurrent_writers: AtomicU32,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_backlog: crate::event::ReadBacklog,
}

impl Connection {
    pub(crate) fn new(ctx: Arc<BusContext>, peer: EndPointAddr, initiator: bool) -> Arc<Connection> {
        let local_id = ctx.next_id();
        Arc::new(Connection {
            ctx,
            peer,
            local_id,
            initiator,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Open,
                protocol_version: -1,
                peer_id: 0,
                epoch: 0,
                migrations: 0,
                reconnect_attempts: 0,
                stuck_migrations: 0,
                delivered_at_last_migration: 0,
                ever_activated: false,
                transport_bound: false,
                pre_active: Vec::new(),
                chain: WriteChain::new(),
                receipts_unflushed: 0,
                msg_out_delivered: 0,
                msg_in: 0,
                msg_in_skip: 0,
                reader_task: None,
                connect_task: None,
                writer_task: None,
                disconnect_cause: None,
                health: HealthState {
                    bytes_read_last: 0,
                    bytes_written_last: 0,
                    unhealthy_since: None,
                },
            }),
            writer: Arc::new(tokio::sync::Mutex::new(WriterSlot { epoch: 0, half: None })),
            writer_wake: Arc::new(Notify::new()),
            queued_bytes: AtomicI64::new(0),
            unacked_bytes: AtomicI64::new(0),
            receipts_to_return: AtomicI32::new(0),
            flushing: AtomicBool::new(false),
            backlog_excessive: AtomicBool::new(false),
            concurrent_writers: AtomicU32::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            read_backlog: crate::event::ReadBacklog::new(),
        })
    }

    pub fn peer(&self) -> &EndPointAddr {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    pub fn local_id(&self) -> i64 {
        self.local_id
    }

    pub fn peer_id(&self) -> i64 {
        self.inner.lock().unwrap().peer_id
    }

    pub fn migrations(&self) -> u32 {
        self.inner.lock().unwrap().migrations
    }

    /// the fault that took this connection down, once DEFUNCT (None for a clean disconnect)
    pub fn disconnect_cause(&self) -> Option<BusError> {
        self.inner.lock().unwrap().disconnect_cause.clone()
    }

    pub(crate) fn is_initiator(&self) -> bool {
        self.initiator
    }

    // ----- send / flush ---------------------------------------------------

    /// Queue a message. Never blocks on I/O: the data is appended to the unflushed batch
    ///  under the connection lock, then either flushed immediately (queued bytes above the
    ///  auto-flush threshold) or left for the periodic flush. Failures never surface here;
    ///  they arrive as DISCONNECT events.
    pub async fn send(self: &Arc<Self>, data: Bytes, receipt: Option<Receipt>) {
        self.concurrent_writers.fetch_add(1, Ordering::Relaxed);

        let flush_now = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ConnectionState::Open => {
                    inner.pre_active.push((data, receipt));
                    false
                }
                ConnectionState::Active => {
                    self.append_locked(&mut inner, data, receipt);
                    self.queued_bytes.load(Ordering::Relaxed)
                        > self.ctx.config.auto_flush_threshold() as i64
                }
                ConnectionState::Defunct | ConnectionState::Final => {
                    debug!("dropping send to defunct connection {}", self.peer);
                    false
                }
            }
        };

        self.check_backlog();

        if flush_now {
            self.optimistic_flush().await;
        }
        else {
            self.mark_pending_flush();
        }

        self.concurrent_writers.fetch_sub(1, Ordering::Relaxed);
    }

    /// append one framed message to the chain; the caller holds the lock
    fn append_locked(&self, inner: &mut ConnectionInner, data: Bytes, receipt: Option<Receipt>) {
        let header = FrameHeader::for_body(
            data.len().prechecked_cast(),
            self.ctx.config.crc_enabled && inner.protocol_version >= crate::wire::VERSION_CRC_FRAMES,
            [data.as_ref()],
        );
        let mut buf = BytesMut::with_capacity(FrameHeader::serialized_len(inner.protocol_version));
        header.ser(inner.protocol_version, &mut buf);

        let outcome = inner.chain.append_message(buf.freeze(), Some(data), receipt);
        if outcome.receipt_requested {
            inner.receipts_unflushed += 1;
        }
        self.queued_bytes.fetch_add(outcome.queued_delta as i64, Ordering::Relaxed);
        self.unacked_bytes.fetch_add(outcome.unacked_delta as i64, Ordering::Relaxed);
    }

    fn mark_pending_flush(self: &Arc<Self>) {
        self.ctx.pending_flush.update(|m| {
            m.insert(self.peer.name().to_string(), self.clone());
        });
    }

    /// Optimistic flush: a single compare-and-swap decides who flushes; losers simply skip,
    ///  relying on the fact that append and the in-progress flush both hold the connection
    ///  lock, so the flusher is guaranteed to observe just-appended data.
    pub async fn optimistic_flush(self: &Arc<Self>) {
        if self.flushing.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }

        self.seal_unflushed();

        // under low contention write directly on the calling task; under contention or heavy
        //  backlog hand the drain to the connection's writer task so application tasks don't
        //  all stall on the socket
        let contended = self.concurrent_writers.load(Ordering::Relaxed)
            > self.ctx.config.direct_write_thread_threshold;
        let heavy = self.queued_bytes.load(Ordering::Relaxed)
            > self.ctx.config.backlog_excessive_threshold() as i64;

        if contended || heavy {
            self.flushing.store(false, Ordering::Release);
            self.writer_wake.notify_one();
        }
        else {
            self.drain().await;
        }
    }

    /// Close the unflushed batch, first appending a receipt control frame if acknowledgements
    ///  are owed in either direction. A forced acknowledgement is demanded once the
    ///  unacknowledged window exceeds its threshold.
    fn seal_unflushed(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectionState::Active {
            return;
        }

        let mut requested = inner.receipts_unflushed;
        let returned = self.receipts_to_return.swap(0, Ordering::AcqRel);

        if requested > 0
            && self.unacked_bytes.load(Ordering::Relaxed) > self.ctx.config.force_ack_threshold as i64 {
            requested = -requested;
            // reset so we don't demand forced acks again before the peer responds
            self.unacked_bytes.store(0, Ordering::Relaxed);
        }

        if requested != 0 || returned != 0 {
            let frame = ControlMessage::Receipt(ControlMessageReceipt { requested, returned })
                .encode_frame(inner.protocol_version, self.ctx.config.crc_enabled);
            let len = inner.chain.append_control(frame, requested != 0);
            self.queued_bytes.fetch_add(len as i64, Ordering::Relaxed);
            inner.receipts_unflushed = 0;
        }

        inner.chain.close_tail();
    }

    /// Drain the chain to the bound transport. Runs with the flushing guard held; byte slices
    ///  are collected under the lock and written outside it, and the epoch is re-validated
    ///  before cursors advance so a migration during the write cannot corrupt the chain.
    async fn drain(self: &Arc<Self>) {
        loop {
            let (slices, epoch) = {
                let mut inner = self.inner.lock().unwrap();
                if !inner.chain.has_unsent() || inner.state != ConnectionState::Active {
                    // clearing the guard inside the lock closes the race with concurrent
                    //  appends: an append either sees the guard cleared or is observed here
                    self.flushing.store(false, Ordering::Release);
                    return;
                }
                inner.chain.bundle_at_send_head(self.ctx.config.auto_flush_threshold());
                (inner.chain.collect_unsent(), inner.epoch)
            };

            let result = {
                let mut writer = self.writer.lock().await;
                if writer.epoch != epoch || writer.half.is_none() {
                    // the transport went away; queued data stays for the migration resend
                    self.flushing.store(false, Ordering::Release);
                    return;
                }
                let io_slices: Vec<IoSlice> = slices.iter().map(|b| IoSlice::new(b)).collect();
                // bounded so a wedged transport cannot pin the writer slot forever; an
                //  expired write is a transport fault like any other
                match tokio::time::timeout(
                    self.ctx.config.ack_timeout,
                    writer.half.as_mut().unwrap().write_vectored(&io_slices),
                ).await {
                    Ok(result) => result,
                    Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out")),
                }
            };

            match result {
                Ok(0) => {
                    self.flushing.store(false, Ordering::Release);
                    self.on_transport_fault(epoch, BusError::Transport("write returned 0".to_string()));
                    return;
                }
                Ok(n) => {
                    {
                        let mut inner = self.inner.lock().unwrap();
                        if inner.epoch != epoch {
                            // migrated mid-write: the chain was rewound, the bytes went to a
                            //  dead socket - don't advance
                            self.flushing.store(false, Ordering::Release);
                            return;
                        }
                        inner.chain.advance_sent(n);
                    }
                    self.queued_bytes.fetch_sub(n as i64, Ordering::Relaxed);
                    self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                    self.check_backlog();
                }
                Err(e) => {
                    self.flushing.store(false, Ordering::Release);
                    self.on_transport_fault(epoch, BusError::transport_from(&e));
                    return;
                }
            }
        }
    }

    /// backlog hysteresis: EXCESSIVE above the threshold, NORMAL only below half of it
    fn check_backlog(&self) {
        let queued = self.queued_bytes.load(Ordering::Relaxed);
        let threshold = self.ctx.config.backlog_excessive_threshold() as i64;

        if queued > threshold {
            if !self.backlog_excessive.swap(true, Ordering::AcqRel) {
                self.ctx.events.emit(BusEvent::BacklogExcessive { peer: self.peer.clone() });
            }
        }
        else if queued < threshold / 2 && self.backlog_excessive.swap(false, Ordering::AcqRel) {
            self.ctx.events.emit(BusEvent::BacklogNormal { peer: self.peer.clone() });
        }
    }

    // ----- activation -----------------------------------------------------

    /// Bind a handshaken transport as the connection's live channel. Returns false if the
    ///  connection cannot take it (teardown in progress, or a simultaneous-connect loser
    ///  finishing late) - the caller just drops the transport, a benign no-op.
    pub(crate) async fn activate(
        self: &Arc<Self>,
        transport: BoxTransport,
        protocol_version: i16,
        peer_id: i64,
        migration: bool,
    ) -> bool {
        let (read_half, write_half) = split(transport);
        let epoch;
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ConnectionState::Defunct | ConnectionState::Final => return false,
                ConnectionState::Active if !migration => return false,
                _ => {}
            }

            // the replacement transport's version governs everything queued from here on,
            //  including a SYNC frame built by the rollback below
            inner.protocol_version = protocol_version;

            if migration && inner.transport_bound {
                // the peer noticed the transport loss before we did: run the rollback now so
                //  our side also rewinds and sends its SYNC on the replacement transport
                self.rollback_locked(&mut inner, "transport replaced by peer migration");
            }

            inner.epoch += 1;
            epoch = inner.epoch;
            inner.transport_bound = true;
            if let Some(task) = inner.reader_task.take() {
                task.abort();
            }

            let was_open = inner.state == ConnectionState::Open;
            inner.state = ConnectionState::Active;
            if inner.peer_id == 0 {
                inner.peer_id = peer_id;
            }
            inner.reconnect_attempts = 0;
            inner.ever_activated = true;

            // frame layout is known now; flush buffered pre-activation sends into the chain
            for (data, receipt) in std::mem::take(&mut inner.pre_active) {
                self.append_locked(&mut inner, data, receipt);
            }

            let conn = self.clone();
            inner.reader_task = Some(tokio::spawn(read_loop(conn, read_half, epoch, protocol_version)));

            if inner.writer_task.is_none() {
                let conn = self.clone();
                inner.writer_task = Some(tokio::spawn(write_loop(conn)));
            }

            if was_open {
                trace!("{} connection to {} active at version {}", self.ctx.local, self.peer, protocol_version);
            }
            else {
                info!("{} resumed connection to {} on a fresh transport (migration #{})",
                    self.ctx.local, self.peer, inner.migrations);
            }
        }

        {
            let mut writer = self.writer.lock().await;
            *writer = WriterSlot { epoch, half: Some(write_half) };
        }

        // anything queued (SYNC, resends, pre-activation sends) goes out now
        self.optimistic_flush().await;
        true
    }

    // ----- read dispatch --------------------------------------------------

    /// Handle one reassembled frame from the reader task. Returns a fatal error for faults
    ///  that must disconnect rather than migrate.
    fn on_frame(self: &Arc<Self>, epoch: u64, frame: RawFrame) -> Result<FrameDisposition, BusError> {
        let mut emitted_receipts = Vec::new();
        let mut payload = None;
        let mut disposition = FrameDisposition::None;

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.epoch != epoch || inner.state >= ConnectionState::Defunct {
                return Ok(FrameDisposition::None);
            }

            if inner.msg_in_skip > 0 {
                inner.msg_in_skip -= 1;
                debug!("{} skipping {} message of {} bytes from {} after migration, {} remain",
                    self.ctx.local, if frame.control { "control" } else { "data" },
                    frame.len(), self.peer, inner.msg_in_skip);
                if inner.msg_in_skip == 0 {
                    info!("{} resumed migrated stream from {}", self.ctx.local, self.peer);
                }
                return Ok(FrameDisposition::None);
            }

            if frame.control {
                let body = frame.to_vec();
                let msg = ControlMessage::deser(inner.protocol_version, &mut &body[..])
                    .map_err(|e| BusError::Protocol(e.to_string()))?;

                match msg {
                    ControlMessage::Receipt(receipt) => {
                        inner.msg_in += 1;

                        if receipt.requested != 0 {
                            self.receipts_to_return.fetch_add(receipt.requested.abs(), Ordering::Relaxed);
                            disposition = if receipt.requested < 0 {
                                FrameDisposition::FlushNow
                            }
                            else {
                                FrameDisposition::FlushLater
                            };
                        }

                        if receipt.returned > 0 {
                            let outcome = inner.chain.process_ack(receipt.returned);
                            inner.msg_out_delivered += outcome.delivered_messages as i64;
                            emitted_receipts = outcome.emitted;
                            // the peer is acking: restart the forced-ack window
                            self.unacked_bytes.store(0, Ordering::Relaxed);
                        }
                    }
                    ControlMessage::Sync(sync) => {
                        // not counted in msg_in: SYNCs are outside both sides' message counts
                        self.process_sync_locked(&mut inner, sync)?;
                    }
                }
            }
            else {
                inner.msg_in += 1;
                payload = Some(MessagePayload::with_backlog(frame.segments, self.read_backlog.clone()));
            }
        }

        for receipt in emitted_receipts {
            self.ctx.events.emit(BusEvent::Receipt { peer: self.peer.clone(), receipt });
        }
        if let Some(payload) = payload {
            self.ctx.events.emit(BusEvent::Message { peer: self.peer.clone(), payload });
        }

        Ok(disposition)
    }

    /// Reconcile the peer's post-migration SYNC: how much of the incoming resend stream we
    ///  must skip, and (informationally) how much the peer will see again. Counts that could
    ///  never have been produced are fatal.
    fn process_sync_locked(&self, inner: &mut ConnectionInner, sync: ControlMessageSync) -> Result<(), BusError> {
        if (sync.cmd & SYNC_CMD_DUMP) != 0 {
            // one-time diagnostic capture requested by a peer whose migrations appear stuck
            warn!("{} peer {} requested diagnostics; connection state: version={} migrations={} \
                   delivered_out={} msg_in={} queued={} unacked={}",
                self.ctx.local, self.peer, inner.protocol_version, inner.migrations,
                inner.msg_out_delivered, inner.msg_in,
                self.queued_bytes.load(Ordering::Relaxed), self.unacked_bytes.load(Ordering::Relaxed));
        }

        if sync.delivered_out > inner.msg_in || inner.msg_out_delivered > sync.seen_in {
            return Err(BusError::OutOfSync(format!(
                "migration sync in {}/{}, out {}/{}",
                sync.delivered_out, inner.msg_in, inner.msg_out_delivered, sync.seen_in)));
        }

        inner.msg_in_skip = inner.msg_in - sync.delivered_out;
        let redeliver = sync.seen_in - inner.msg_out_delivered;
        info!("{} synchronizing migrated connection with {}: {} skip(s), {} redelivery(s)",
            self.ctx.local, self.peer, inner.msg_in_skip, redeliver);
        Ok(())
    }

    // ----- faults, migration, teardown -------------------------------------

    /// classify and route a fault observed on the transport bound at `epoch`
    pub(crate) fn on_transport_fault(self: &Arc<Self>, epoch: u64, error: BusError) {
        {
            let inner = self.inner.lock().unwrap();
            if inner.epoch != epoch || inner.state >= ConnectionState::Defunct {
                return; // stale: the transport was already replaced or torn down
            }
        }
        self.handle_fault(error);
    }

    pub(crate) fn handle_fault(self: &Arc<Self>, error: BusError) {
        let can_migrate = {
            let inner = self.inner.lock().unwrap();
            error.is_migration_eligible()
                && inner.state < ConnectionState::Defunct
                && inner.protocol_version >= VERSION_RECONNECT
                && self.ctx.is_open()
                && self.ctx.config.max_reconnect_attempts
                    .map(|max| inner.reconnect_attempts < max)
                    .unwrap_or(true)
        };

        if can_migrate {
            self.migrate(error);
        }
        else {
            self.schedule_disconnect(Some(error));
        }
    }

    /// Detach from the failed transport and prepare the chain for retransmission: rewind to
    ///  the acknowledged position, place a SYNC frame ahead of everything, and - on the
    ///  initiating side - schedule the reconnect.
    pub(crate) fn migrate(self: &Arc<Self>, cause: BusError) {
        let reconnect = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state >= ConnectionState::Defunct {
                return;
            }

            self.rollback_locked(&mut inner, &cause.to_string());

            self.initiator
        };

        if reconnect {
            // replaces a reconnect loop that may already be running; attempts carry over
            self.spawn_connect(ConnectType::Migrate);
        }
        // else: the accepting side waits for the peer's MIGRATE introduction
    }

    /// The migration rollback proper: detach from the transport, rewind the chain so every
    ///  unacknowledged byte is retransmitted, and place the SYNC reconciliation frame ahead
    ///  of the resend queue. Runs on the side that detects the fault and, if the peer's
    ///  MIGRATE introduction arrives before the fault was noticed locally, on the accept
    ///  path instead.
    fn rollback_locked(&self, inner: &mut ConnectionInner, cause: &str) {
        inner.migrations += 1;
        inner.epoch += 1;
        inner.transport_bound = false;
        if let Some(task) = inner.reader_task.take() {
            task.abort();
        }
        self.clear_stale_writer(inner.epoch);

        // escalation bookkeeping: no acknowledgement progress since the last migration
        //  means we are stuck against the same pending receipt
        if inner.msg_out_delivered == inner.delivered_at_last_migration && inner.migrations > 1 {
            inner.stuck_migrations += 1;
        }
        else {
            inner.stuck_migrations = 0;
        }
        inner.delivered_at_last_migration = inner.msg_out_delivered;

        inner.msg_in_skip = 0; // the peer's fresh SYNC will say how much to skip

        let delta = inner.chain.rewind_all();
        self.queued_bytes.fetch_add(delta, Ordering::Relaxed);

        let dump = inner.stuck_migrations == self.ctx.config.migration_limit_before_dump;
        let sync = ControlMessage::Sync(ControlMessageSync {
            delivered_out: inner.msg_out_delivered,
            seen_in: inner.msg_in,
            cmd: if dump { SYNC_CMD_DUMP } else { SYNC_CMD_NONE },
        });
        let frame = sync.encode_frame(inner.protocol_version, self.ctx.config.crc_enabled);
        let delta = inner.chain.prepend_sync(frame);
        self.queued_bytes.fetch_add(delta, Ordering::Relaxed);

        warn!("{} migrating connection to {} (#{}) after: {}",
            self.ctx.local, self.peer, inner.migrations, cause);
    }

    /// drop a write half bound to an epoch older than `valid_epoch`, closing the socket
    fn clear_stale_writer(&self, valid_epoch: u64) {
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let mut slot = writer.lock().await;
            if slot.epoch < valid_epoch {
                slot.half = None;
            }
        });
    }

    /// Start (or restart) the outbound connect/handshake attempt loop. Owns the connection's
    ///  reconnect delay and attempt-cap policy.
    pub(crate) fn spawn_connect(self: &Arc<Self>, connect_type: ConnectType) {
        let conn = self.clone();
        let task = tokio::spawn(async move {
            connect_loop(conn, connect_type).await;
        });

        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.connect_task.replace(task) {
            old.abort();
        }
    }

    pub(crate) fn abort_connect_attempt(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.connect_task.take() {
            task.abort();
        }
    }

    pub(crate) fn connect_attempt_finished(&self) {
        self.inner.lock().unwrap().connect_task = None;
    }

    /// Idempotent teardown, first half: no more exchanges, DISCONNECT emitted with the causal
    ///  fault. The connection stays in the bus map until released.
    pub(crate) fn schedule_disconnect(self: &Arc<Self>, cause: Option<BusError>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state >= ConnectionState::Defunct {
                return;
            }
            inner.state = ConnectionState::Defunct;
            inner.epoch += 1;
            inner.transport_bound = false;
            inner.disconnect_cause = cause.clone();
            if let Some(task) = inner.reader_task.take() {
                task.abort();
            }
            if let Some(task) = inner.connect_task.take() {
                task.abort();
            }
            self.clear_stale_writer(inner.epoch);
        }

        if let Some(cause) = &cause {
            warn!("{} disconnecting {}: {}", self.ctx.local, self.peer, cause);
        }
        else {
            debug!("{} disconnecting {}", self.ctx.local, self.peer);
        }
        self.ctx.events.emit(BusEvent::Disconnect { peer: self.peer.clone(), cause });
    }

    /// Idempotent teardown, second half: resources reclaimed, RELEASE emitted, connection
    ///  removed from the bus map.
    pub(crate) fn schedule_release(self: &Arc<Self>) {
        self.schedule_disconnect(None);

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ConnectionState::Final {
                return;
            }
            inner.state = ConnectionState::Final;
            if let Some(task) = inner.writer_task.take() {
                task.abort();
            }
        }

        self.ctx.connections.remove(&self.peer.name().to_string());
        self.ctx.events.emit(BusEvent::Release { peer: self.peer.clone() });
        self.ctx.drained.notify_waiters();
    }

    // ----- health ---------------------------------------------------------

    /// Periodic health check. A connection is unhealthy when it neither makes write progress
    ///  (nothing written and something queued) nor read progress while acknowledgements are
    ///  outstanding. Sustained unhealthiness migrates after the (escalating, capped) ack
    ///  timeout and disconnects unconditionally after the fatal timeout.
    pub(crate) fn check_health(self: &Arc<Self>, now: Instant) {
        enum Action { None, Migrate, Disconnect }

        let action = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state > ConnectionState::Active {
                return;
            }

            let bytes_written = self.bytes_written.load(Ordering::Relaxed);
            let write_healthy = bytes_written > inner.health.bytes_written_last
                || self.queued_bytes.load(Ordering::Relaxed) == 0;

            let bytes_read = self.bytes_read.load(Ordering::Relaxed);
            let read_healthy = bytes_read > inner.health.bytes_read_last
                || !inner.chain.has_sent_unacked();

            inner.health.bytes_written_last = bytes_written;
            inner.health.bytes_read_last = bytes_read;

            if write_healthy && read_healthy {
                inner.health.unhealthy_since = None;
                Action::None
            }
            else {
                let since = *inner.health.unhealthy_since.get_or_insert(now);
                let stalled = now.duration_since(since);

                let escalation = (1 + inner.stuck_migrations).min(self.ctx.config.ack_timeout_escalation_cap);
                let soft = self.ctx.config.ack_timeout * escalation;

                if stalled >= self.ctx.config.fatal_timeout {
                    Action::Disconnect
                }
                else if stalled >= soft && inner.state == ConnectionState::Active {
                    inner.health.unhealthy_since = None;
                    Action::Migrate
                }
                else {
                    Action::None
                }
            }
        };

        match action {
            Action::None => {}
            Action::Migrate => self.handle_fault(BusError::Transport("acknowledgement timeout".to_string())),
            Action::Disconnect => self.schedule_disconnect(
                Some(BusError::Transport("unresponsive past the fatal timeout".to_string()))),
        }
    }

    // ----- handshake support ----------------------------------------------

    /// the introduction this side sends when initiating a handshake
    pub(crate) fn outbound_introduction(&self, connect_type: ConnectType) -> Introduction {
        let inner = self.inner.lock().unwrap();
        Introduction {
            name: self.ctx.local.name().to_string(),
            connect_type,
            sender_id: self.local_id,
            receiver_id: inner.peer_id,
        }
    }

    /// Verify the accepting side's introduction against this connection's identities. The
    ///  peer answering under an unexpected name is permissive (logged upstream); identity
    ///  mismatches beyond the unknown-id exceptions are protocol errors.
    pub(crate) fn verify_peer_identity(&self, intro: &Introduction) -> Result<(), BusError> {
        let inner = self.inner.lock().unwrap();
        if intro.receiver_id != 0 && intro.receiver_id != self.local_id {
            return Err(BusError::Protocol(format!(
                "peer {} introduced us as id {} but we are {}",
                self.peer, intro.receiver_id, self.local_id)));
        }
        if intro.sender_id != 0 && inner.peer_id != 0 && intro.sender_id != inner.peer_id {
            return Err(BusError::Protocol(format!(
                "peer {} introduced itself as id {} but was known as {}",
                self.peer, intro.sender_id, inner.peer_id)));
        }
        Ok(())
    }

    /// true iff the given introduction identifies this very logical connection, making an
    ///  inbound transport eligible to resume it
    pub(crate) fn matches_migration(&self, intro: &Introduction) -> bool {
        let inner = self.inner.lock().unwrap();
        let this_matches = intro.receiver_id == 0 || intro.receiver_id == self.local_id;
        let that_matches = intro.sender_id == 0 || inner.peer_id == 0 || intro.sender_id == inner.peer_id;
        // at least one side must be positively identified
        let identified = intro.receiver_id == self.local_id
            || (intro.sender_id != 0 && intro.sender_id == inner.peer_id)
            || inner.protocol_version == VERSION_RECONNECT; // v1 has no identities to check
        this_matches && that_matches && identified
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FrameDisposition {
    None,
    /// the peer demanded an immediate acknowledgement flush
    FlushNow,
    /// acknowledgements are owed; the periodic flush will carry them
    FlushLater,
}

// ----- tasks ---------------------------------------------------------------

/// The connection's reader: owns the read half and the reassembly state. Frames are
///  dispatched inline, so everything on the read path for one connection is serialized.
async fn read_loop(
    conn: Arc<Connection>,
    mut read_half: ReadHalf<BoxTransport>,
    epoch: u64,
    protocol_version: i16,
) {
    let mut batch = ReadBatch::new(protocol_version, conn.ctx.config.crc_enabled);
    let throttle = conn.ctx.config.read_throttle_threshold as i64;

    loop {
        // local backlog: stop reading while the application sits on undisposed events
        while conn.read_backlog.bytes.load(Ordering::Relaxed) > throttle {
            conn.read_backlog.drained.notified().await;
        }

        let mut buf = conn.ctx.pool.acquire();
        buf.maximize_len();
        let n = match read_half.read(buf.as_mut()).await {
            Ok(0) => {
                conn.on_transport_fault(epoch, BusError::Transport("closed by peer".to_string()));
                return;
            }
            Ok(n) => n,
            Err(e) => {
                conn.on_transport_fault(epoch, BusError::transport_from(&e));
                return;
            }
        };
        buf.truncate(n);
        conn.bytes_read.fetch_add(n as u64, Ordering::Relaxed);

        batch.push(SharedBuffer::new(buf, conn.ctx.pool.clone()));

        loop {
            match batch.poll() {
                Ok(Some(frame)) => {
                    match conn.on_frame(epoch, frame) {
                        Ok(FrameDisposition::None) => {}
                        Ok(FrameDisposition::FlushNow) => conn.optimistic_flush().await,
                        Ok(FrameDisposition::FlushLater) => conn.mark_pending_flush(),
                        Err(fatal) => {
                            conn.schedule_disconnect(Some(fatal));
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    conn.on_transport_fault(epoch, BusError::Integrity(e.to_string()));
                    return;
                }
            }
        }
    }
}

/// the connection's writer: drains the chain when flushes are handed off
async fn write_loop(conn: Arc<Connection>) {
    loop {
        conn.writer_wake.notified().await;
        if conn.state() >= ConnectionState::Defunct {
            return;
        }
        if conn.flushing.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            conn.seal_unflushed();
            conn.drain().await;
        }
    }
}

/// Outbound connect/handshake attempts, with the configured damping delays and the attempt
///  cap beyond which the connection is torn down instead of migrated further.
async fn connect_loop(conn: Arc<Connection>, mut connect_type: ConnectType) {
    loop {
        let (attempt, ever_activated) = {
            let inner = conn.inner.lock().unwrap();
            if inner.state >= ConnectionState::Defunct {
                return;
            }
            (inner.reconnect_attempts, inner.ever_activated)
        };

        // damp churn: back off harder when the very first connect failed or after losing a
        //  simultaneous-connect tie-break (never activated); plain migrations retry quickly
        let delay = if attempt == 0 && connect_type == ConnectType::New {
            Duration::ZERO
        }
        else if !ever_activated {
            conn.ctx.config.reconnect_backoff_delay
        }
        else {
            conn.ctx.config.reconnect_delay
        };
        sleep(delay).await;

        if ever_activated {
            connect_type = ConnectType::Migrate;
        }

        match attempt_handshake(&conn, connect_type).await {
            Ok(true) => {
                conn.connect_attempt_finished();
                return;
            }
            Ok(false) => {
                // lost a connection race; the surviving transport serves this connection
                conn.connect_attempt_finished();
                return;
            }
            Err(e @ (BusError::Protocol(_) | BusError::OutOfSync(_) | BusError::Security(_))) => {
                conn.connect_attempt_finished();
                conn.schedule_disconnect(Some(e));
                return;
            }
            Err(e) => {
                debug!("{} connect attempt {} to {} failed: {}", conn.ctx.local, attempt + 1, conn.peer, e);
                let exhausted = {
                    let mut inner = conn.inner.lock().unwrap();
                    inner.reconnect_attempts += 1;
                    conn.ctx.config.max_reconnect_attempts
                        .map(|max| inner.reconnect_attempts >= max)
                        .unwrap_or(false)
                };
                if exhausted {
                    conn.connect_attempt_finished();
                    conn.schedule_disconnect(Some(BusError::Transport(
                        "reconnect attempts exhausted".to_string())));
                    return;
                }
            }
        }
    }
}

async fn attempt_handshake(conn: &Arc<Connection>, connect_type: ConnectType) -> Result<bool, BusError> {
    let transport = conn.ctx.factory.connect(conn.peer.addr()).await
        .map_err(|e| BusError::transport_from(&e))?;

    let intro = conn.outbound_introduction(connect_type);
    let handshaken = tokio::time::timeout(
        conn.ctx.config.handshake_timeout,
        handshake::initiate(transport, &conn.ctx.local, &conn.peer, intro),
    ).await.map_err(|_| BusError::Transport("handshake timed out".to_string()))??;

    conn.verify_peer_identity(&handshaken.peer_intro)?;

    let activated = conn.activate(
        handshaken.transport,
        handshaken.protocol_version,
        handshaken.peer_intro.sender_id,
        connect_type == ConnectType::Migrate,
    ).await;

    Ok(activated)
}
