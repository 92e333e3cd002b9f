//! The bus: registry of peer connections, the accept path for inbound transports, periodic
//!  flush and health sweeps, and the bus-wide lifecycle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use anyhow::bail;
use bytes::Bytes;
use rand::seq::SliceRandom;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::buffers::atomic_map::AtomicMap;
use crate::buffers::buffer_pool::BufferPool;
use crate::config::BusConfig;
use crate::connection::{Connection, ConnectionState};
use crate::end_point::EndPointAddr;
use crate::event::{event_channel, BusEvent, EventSink, Receipt};
use crate::handshake;
use crate::handshake::InboundIntroduced;
use crate::transport::{Acceptor, BoxTransport, TransportFactory};
use crate::wire::negotiation::{ConnectType, Introduction};

/// Bus lifecycle; monotonic, never decreases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BusState {
    Initial,
    Open,
    Closing,
    Closed,
}

/// Everything a connection needs from its bus, shared by reference: configuration, the event
///  sink, the buffer pool, the transport factory and the registries. Identity generation is
///  scoped here - one sequence per bus instance, no global state.
pub(crate) struct BusContext {
    pub config: BusConfig,
    pub local: EndPointAddr,
    pub events: EventSink,
    pub pool: Arc<BufferPool>,
    pub factory: Arc<dyn TransportFactory>,
    pub state: RwLock<BusState>,
    /// peer canonical name -> connection; at most one live connection per peer
    pub connections: AtomicMap<String, Arc<Connection>>,
    /// connections with unflushed data or pending receipt returns, swept periodically
    pub pending_flush: AtomicMap<String, Arc<Connection>>,
    /// fires whenever a connection leaves the map; close() waits on it
    pub drained: Notify,
    pub ids: AtomicI64,
}

impl BusContext {
    /// process-unique, monotonically increasing, non-zero connection identity
    pub fn next_id(&self) -> i64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn bus_state(&self) -> BusState {
        *self.state.read().unwrap()
    }

    pub fn is_open(&self) -> bool {
        self.bus_state() == BusState::Open
    }
}

/// seed the identity sequence with wall-clock millis so identities stay unique across
///  process restarts as well
fn id_seed() -> i64 {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(1);
    millis.max(1)
}

/// A reliable, message-oriented bus over stream transports: ordered delivery with receipts,
///  transparent reconnection on transport failure, at most one logical connection per peer.
pub struct SocketBus {
    ctx: Arc<BusContext>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketBus {
    /// Create a bus on the given transport factory. The returned receiver is the event
    ///  stream; MESSAGE payloads release their buffers when dropped, so the consumer should
    ///  drain it promptly.
    pub fn new(
        config: BusConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> anyhow::Result<(SocketBus, UnboundedReceiver<BusEvent>)> {
        config.validate()?;

        let (events, receiver) = event_channel();
        let pool = Arc::new(BufferPool::new(config.read_buf_size, config.buffer_pool_size));
        let local = config.local_end_point();

        let ctx = Arc::new(BusContext {
            config,
            local,
            events,
            pool,
            factory,
            state: RwLock::new(BusState::Initial),
            connections: AtomicMap::new(),
            pending_flush: AtomicMap::new(),
            drained: Notify::new(),
            ids: AtomicI64::new(id_seed()),
        });

        Ok((SocketBus { ctx, tasks: Mutex::new(Vec::new()) }, receiver))
    }

    pub fn local(&self) -> &EndPointAddr {
        &self.ctx.local
    }

    pub fn state(&self) -> BusState {
        self.ctx.bus_state()
    }

    /// Bind, start accepting inbound transports and start the periodic flush and health
    ///  sweeps. Emits OPEN. Returns the actually bound address.
    pub async fn open(&self) -> anyhow::Result<SocketAddr> {
        {
            let mut state = self.ctx.state.write().unwrap();
            if *state != BusState::Initial {
                bail!("bus cannot open from state {:?}", *state);
            }
            *state = BusState::Open;
        }

        let mut acceptor = self.ctx.factory.listen(self.ctx.config.bind_addr).await?;
        let bound = acceptor.local_addr();
        info!("{} bus open, accepting on {:?}", self.ctx.local, bound);

        let mut tasks = self.tasks.lock().unwrap();

        let ctx = self.ctx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok(transport) => {
                        let ctx = ctx.clone();
                        tokio::spawn(handle_inbound(ctx, transport));
                    }
                    Err(e) => {
                        if !ctx.is_open() {
                            return;
                        }
                        warn!("accept failure: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }));

        let ctx = self.ctx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(ctx.config.flush_interval);
            loop {
                ticker.tick().await;
                sweep_pending_flush(&ctx).await;
            }
        }));

        let ctx = self.ctx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(ctx.config.health_check_interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                for conn in ctx.connections.load().values() {
                    conn.check_health(now);
                }
            }
        }));

        self.ctx.events.emit(BusEvent::Open { local: self.ctx.local.clone() });
        Ok(bound)
    }

    /// Establish (or find) the connection to a peer. Racing connects for the same peer are
    ///  benign: exactly one connection wins the map, the loser is dropped unused.
    pub async fn connect(&self, peer: EndPointAddr) -> anyhow::Result<()> {
        if !self.ctx.is_open() {
            bail!("bus is not open");
        }
        if peer.name() == self.ctx.local.name() {
            bail!("cannot connect to self");
        }

        let conn = Connection::new(self.ctx.clone(), peer.clone(), true);
        let (inserted, _) = self.ctx.connections.insert_if_absent(peer.name().to_string(), conn.clone());
        if !inserted {
            debug!("{} connect to {} ignored, connection exists", self.ctx.local, peer);
            return Ok(());
        }

        self.ctx.events.emit(BusEvent::Connect { peer });
        conn.spawn_connect(ConnectType::New);
        Ok(())
    }

    /// Queue a message to a connected peer. Delivery failures never surface here; they
    ///  arrive as DISCONNECT events.
    pub async fn send(&self, peer_name: &str, data: Bytes, receipt: Option<Receipt>) -> anyhow::Result<()> {
        let Some(conn) = self.ctx.connections.get(&peer_name.to_string()) else {
            bail!("no connection to peer '{}'", peer_name);
        };
        conn.send(data, receipt).await;
        Ok(())
    }

    /// flush every connection marked pending, in randomized order
    pub async fn flush(&self) {
        sweep_pending_flush(&self.ctx).await;
    }

    pub fn disconnect(&self, peer_name: &str) {
        if let Some(conn) = self.ctx.connections.get(&peer_name.to_string()) {
            conn.schedule_disconnect(None);
        }
    }

    pub fn release(&self, peer_name: &str) {
        if let Some(conn) = self.ctx.connections.get(&peer_name.to_string()) {
            conn.schedule_release();
        }
    }

    pub(crate) fn connection(&self, peer_name: &str) -> Option<Arc<Connection>> {
        self.ctx.connections.get(&peer_name.to_string())
    }

    /// Stop accepting, drain every connection (disconnect then release) and emit CLOSE.
    pub async fn close(&self) {
        {
            let mut state = self.ctx.state.write().unwrap();
            match *state {
                BusState::Closed => return,
                BusState::Initial => {
                    *state = BusState::Closed;
                    return;
                }
                _ => *state = BusState::Closing,
            }
        }

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        // releases run synchronously, but an in-flight handshake may still slip an entry into
        //  the map; sweep until it stays empty
        loop {
            let remaining = self.ctx.connections.load();
            if remaining.is_empty() {
                break;
            }
            for conn in remaining.values() {
                conn.schedule_release();
            }
            let _ = timeout(Duration::from_millis(100), self.ctx.drained.notified()).await;
        }

        *self.ctx.state.write().unwrap() = BusState::Closed;
        info!("{} bus closed", self.ctx.local);
        self.ctx.events.emit(BusEvent::Close { local: self.ctx.local.clone() });
    }
}

async fn sweep_pending_flush(ctx: &Arc<BusContext>) {
    let snapshot = ctx.pending_flush.load();
    if snapshot.is_empty() {
        return;
    }

    let mut pending: Vec<(String, Arc<Connection>)> = snapshot.iter()
        .map(|(name, conn)| (name.clone(), conn.clone()))
        .collect();
    // randomized order so one congested connection cannot starve the rest
    pending.shuffle(&mut rand::thread_rng());

    for (name, conn) in pending {
        ctx.pending_flush.remove(&name);
        conn.optimistic_flush().await;
    }
}

// ----- inbound handshake resolution ----------------------------------------

enum Resolution {
    AcceptNew(Arc<Connection>),
    AcceptMigrate(Arc<Connection>),
    Retry,
    Abandon(&'static str),
}

async fn handle_inbound(ctx: Arc<BusContext>, transport: BoxTransport) {
    let introduced = match timeout(
        ctx.config.handshake_timeout,
        handshake::accept_inbound(transport, &ctx.local),
    ).await {
        Ok(Ok(introduced)) => introduced,
        Ok(Err(e)) => {
            debug!("{} inbound handshake failed: {}", ctx.local, e);
            return;
        }
        Err(_) => {
            debug!("{} inbound handshake timed out", ctx.local);
            return;
        }
    };

    // bounded retry: a prior connection for this peer may be mid-release
    for _ in 0..10 {
        match resolve_inbound(&ctx, &introduced.peer_intro) {
            Resolution::Retry => {
                sleep(Duration::from_millis(10)).await;
            }
            Resolution::Abandon(reason) => {
                debug!("{} abandoning inbound handshake from '{}': {}",
                    ctx.local, introduced.peer_intro.name, reason);
                let _ = timeout(ctx.config.handshake_timeout, introduced.abandon()).await;
                return;
            }
            Resolution::AcceptNew(conn) => {
                finish_accept(&ctx, introduced, conn, false).await;
                return;
            }
            Resolution::AcceptMigrate(conn) => {
                finish_accept(&ctx, introduced, conn, true).await;
                return;
            }
        }
    }

    debug!("{} giving up on inbound handshake from '{}' after retries",
        ctx.local, introduced.peer_intro.name);
}

/// Decide what an inbound introduction means, cf. the accept-path race matrix: a fresh
///  connection, a migration resuming an existing one, a simultaneous-connect collision
///  resolved by canonical-name order (lower name wins), a deferral while the prior connection
///  tears down, or a retry while it is mid-release.
fn resolve_inbound(ctx: &Arc<BusContext>, intro: &Introduction) -> Resolution {
    if !ctx.is_open() {
        return Resolution::Abandon("bus is not open");
    }

    let peer_name = intro.name.clone();
    let existing = ctx.connections.get(&peer_name);

    if intro.connect_type == ConnectType::Migrate {
        return match existing {
            Some(conn) if conn.state() < ConnectionState::Defunct && conn.matches_migration(intro) => {
                Resolution::AcceptMigrate(conn)
            }
            Some(_) => Resolution::Abandon("migration identity mismatch"),
            None => Resolution::Abandon("migration for unknown connection"),
        };
    }

    match existing {
        None => {
            let peer = EndPointAddr::new(peer_name.clone(), unspecified_addr());
            let conn = Connection::new(ctx.clone(), peer.clone(), false);
            let (inserted, winner) = ctx.connections.insert_if_absent(peer_name, conn);
            if !inserted {
                // lost an insert race; re-resolve against the winner
                drop(winner);
                return Resolution::Retry;
            }
            ctx.events.emit(BusEvent::Connect { peer });
            Resolution::AcceptNew(winner)
        }
        Some(conn) => {
            match conn.state() {
                ConnectionState::Final => Resolution::Retry, // mid-release, about to vanish
                ConnectionState::Defunct => Resolution::Abandon("existing connection mid-teardown"),
                _ if intro.sender_id != 0 && conn.peer_id() == intro.sender_id => {
                    // the peer lost its transport while half connected: it never learned our
                    //  identity and can only reconnect as NEW, but we know enough to resume
                    Resolution::AcceptMigrate(conn)
                }
                ConnectionState::Open if conn.is_initiator() => {
                    if ctx.local.name() < intro.name.as_str() {
                        // our outbound connect has priority; the peer will accept it and
                        //  close this one
                        Resolution::Abandon("lost simultaneous-connect tie-break")
                    }
                    else {
                        // the peer's connect wins: its transport replaces our pending one
                        conn.abort_connect_attempt();
                        Resolution::AcceptNew(conn)
                    }
                }
                ConnectionState::Open => Resolution::Abandon("inbound connection already pending"),
                _ => Resolution::Abandon("connection already established"),
            }
        }
    }
}

async fn finish_accept(
    ctx: &Arc<BusContext>,
    introduced: InboundIntroduced,
    conn: Arc<Connection>,
    migration: bool,
) {
    let peer_intro = introduced.peer_intro.clone();
    let reply = Introduction {
        name: ctx.local.name().to_string(),
        connect_type: if migration { ConnectType::Migrate } else { ConnectType::New },
        sender_id: conn.local_id(),
        receiver_id: if conn.peer_id() != 0 { conn.peer_id() } else { peer_intro.sender_id },
    };

    let handshaken = match timeout(ctx.config.handshake_timeout, introduced.accept(reply)).await {
        Ok(Ok(handshaken)) => handshaken,
        Ok(Err(e)) => {
            debug!("{} inbound accept of '{}' failed: {}", ctx.local, peer_intro.name, e);
            return;
        }
        Err(_) => {
            debug!("{} inbound accept of '{}' timed out", ctx.local, peer_intro.name);
            return;
        }
    };

    if !conn.activate(handshaken.transport, handshaken.protocol_version, peer_intro.sender_id, migration).await {
        debug!("{} discarding inbound transport for '{}', connection went away", ctx.local, peer_intro.name);
    }
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use crate::error::BusError;
    use crate::test_util::memory_net::MemoryNet;
    use crate::test_util::{collect_until, drain_events};
    use crate::transport::MockTransportFactory;
    use super::*;

    async fn new_bus(net: &Arc<MemoryNet>, name: &str) -> (SocketBus, UnboundedReceiver<BusEvent>, SocketAddr) {
        let mut config = BusConfig::default_for(name, SocketAddr::from(([127, 0, 0, 1], 0)));
        config.flush_interval = Duration::from_millis(5);
        config.health_check_interval = Duration::from_millis(100);
        config.reconnect_delay = Duration::from_millis(10);
        config.reconnect_backoff_delay = Duration::from_millis(50);

        let (bus, receiver) = SocketBus::new(config, net.clone()).unwrap();
        let addr = bus.open().await.unwrap();
        (bus, receiver, addr)
    }

    async fn await_active(bus: &SocketBus, peer: &str) {
        for _ in 0..1000 {
            if let Some(conn) = bus.connection(peer) {
                if conn.state() == ConnectionState::Active {
                    return;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("connection to '{}' did not become active", peer);
    }

    fn received_messages(events: &[BusEvent]) -> Vec<Vec<u8>> {
        events.iter()
            .filter_map(|e| match e {
                BusEvent::Message { payload, .. } => Some(payload.to_vec()),
                _ => None,
            })
            .collect()
    }

    fn received_receipts(events: &[BusEvent]) -> Vec<u64> {
        events.iter()
            .filter_map(|e| match e {
                BusEvent::Receipt { receipt, .. } => Some(*receipt),
                _ => None,
            })
            .collect()
    }

    fn assert_no_disconnect(events: &[BusEvent]) {
        assert!(!events.iter().any(|e| matches!(e, BusEvent::Disconnect { .. })),
            "unexpected disconnect in {:?}", events);
    }

    /// BACKLOG_EXCESSIVE and BACKLOG_NORMAL must strictly alternate
    fn assert_backlog_alternation(events: &[BusEvent]) {
        let mut excessive = false;
        for event in events {
            match event {
                BusEvent::BacklogExcessive { .. } => {
                    assert!(!excessive, "BACKLOG_EXCESSIVE emitted twice without BACKLOG_NORMAL");
                    excessive = true;
                }
                BusEvent::BacklogNormal { .. } => {
                    assert!(excessive, "BACKLOG_NORMAL emitted without preceding BACKLOG_EXCESSIVE");
                    excessive = false;
                }
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_receive_with_receipt() {
        let net = MemoryNet::new();
        let (bus_a, mut events_a, _) = new_bus(&net, "a").await;
        let (_bus_b, mut events_b, addr_b) = new_bus(&net, "b").await;

        bus_a.connect(EndPointAddr::new("b", addr_b)).await.unwrap();
        bus_a.send("b", Bytes::from_static(b"hello bus"), Some(1)).await.unwrap();

        let at_b = collect_until(&mut events_b, |e| matches!(e, BusEvent::Message { .. })).await;
        match at_b.last().unwrap() {
            BusEvent::Message { peer, payload } => {
                assert_eq!(peer.name(), "a");
                assert_eq!(payload.to_vec(), b"hello bus");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let at_a = collect_until(&mut events_a, |e| matches!(e, BusEvent::Receipt { .. })).await;
        assert_eq!(received_receipts(&at_a), vec![1]);
        assert_no_disconnect(&at_a);
        assert_no_disconnect(&at_b);

        bus_a.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipts_arrive_in_submission_order() {
        let net = MemoryNet::new();
        let (bus_a, mut events_a, _) = new_bus(&net, "a").await;
        let (_bus_b, mut events_b, addr_b) = new_bus(&net, "b").await;

        bus_a.connect(EndPointAddr::new("b", addr_b)).await.unwrap();
        for i in 0..50u64 {
            let with_receipt = i % 3 != 0; // a mix of receipted and bare sends
            bus_a.send("b", Bytes::from(format!("m{}", i)), with_receipt.then_some(i)).await.unwrap();
        }

        let expected: Vec<u64> = (0..50).filter(|i| i % 3 != 0).collect();
        let at_a = collect_until(&mut events_a, {
            let want = *expected.last().unwrap();
            move |e| matches!(e, BusEvent::Receipt { receipt, .. } if *receipt == want)
        }).await;
        assert_eq!(received_receipts(&at_a), expected);

        let at_b = collect_until(&mut events_b, |e|
            matches!(e, BusEvent::Message { payload, .. } if payload.to_vec() == b"m49")).await;
        assert_eq!(received_messages(&at_b).len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thousand_messages_survive_transport_drop() {
        let net = MemoryNet::new();
        let (bus_a, mut events_a, _) = new_bus(&net, "a").await;
        let (_bus_b, mut events_b, addr_b) = new_bus(&net, "b").await;

        bus_a.connect(EndPointAddr::new("b", addr_b)).await.unwrap();
        await_active(&bus_a, "b").await;

        for i in 0..1000u64 {
            bus_a.send("b", Bytes::from(format!("msg-{:04}", i)), Some(i)).await.unwrap();
            if i % 100 == 99 {
                // interleave real transmission so the cut hits a partially delivered stream
                bus_a.flush().await;
                tokio::task::yield_now().await;
            }
            if i == 400 {
                net.sever_all();
            }
        }

        let at_b = collect_until(&mut events_b, |e|
            matches!(e, BusEvent::Message { payload, .. } if payload.to_vec() == b"msg-0999")).await;
        let messages = received_messages(&at_b);
        let expected: Vec<Vec<u8>> = (0..1000).map(|i| format!("msg-{:04}", i).into_bytes()).collect();
        assert_eq!(messages, expected, "no loss, no duplication, in order");

        let at_a = collect_until(&mut events_a, |e|
            matches!(e, BusEvent::Receipt { receipt, .. } if *receipt == 999)).await;
        let receipts = received_receipts(&at_a);
        assert_eq!(receipts, (0..1000).collect::<Vec<_>>(), "every receipt exactly once, in order");

        assert!(bus_a.connection("b").unwrap().migrations() >= 1);
        assert_no_disconnect(&at_a);
        assert_no_disconnect(&at_b);
        assert_backlog_alternation(&at_a);
    }

    #[rstest]
    #[case::one_failure(1)]
    #[case::repeated_failures(4)]
    fn test_migration_idempotence_under_repeated_drops(#[case] drops: usize) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let net = MemoryNet::new();
            let mut config = BusConfig::default_for("a", SocketAddr::from(([127, 0, 0, 1], 0)));
            config.flush_interval = Duration::from_millis(5);
            config.reconnect_delay = Duration::from_millis(10);
            config.max_reconnect_attempts = None; // unlimited
            let (bus_a, mut events_a) = SocketBus::new(config, net.clone()).unwrap();
            bus_a.open().await.unwrap();
            let (_bus_b, mut events_b, addr_b) = new_bus(&net, "b").await;

            bus_a.connect(EndPointAddr::new("b", addr_b)).await.unwrap();
            await_active(&bus_a, "b").await;

            let per_round = 300 / drops;
            for round in 0..drops {
                for i in 0..per_round {
                    let n = (round * per_round + i) as u64;
                    bus_a.send("b", Bytes::from(format!("m-{:04}", n)), Some(n)).await.unwrap();
                    if i % 25 == 24 {
                        bus_a.flush().await;
                        tokio::task::yield_now().await;
                    }
                }
                net.sever_all();
            }
            let total = (drops * per_round) as u64;

            let last = format!("m-{:04}", total - 1).into_bytes();
            let at_b = collect_until(&mut events_b, |e|
                matches!(e, BusEvent::Message { payload, .. } if payload.to_vec() == last)).await;
            let expected: Vec<Vec<u8>> = (0..total).map(|i| format!("m-{:04}", i).into_bytes()).collect();
            assert_eq!(received_messages(&at_b), expected);

            let at_a = collect_until(&mut events_a, |e|
                matches!(e, BusEvent::Receipt { receipt, .. } if *receipt == total - 1)).await;
            assert_eq!(received_receipts(&at_a), (0..total).collect::<Vec<_>>());
            assert_no_disconnect(&at_a);
            assert_no_disconnect(&at_b);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_connect_resolves_to_one_connection() {
        let net = MemoryNet::new();
        let (bus_a, mut events_a, addr_a) = new_bus(&net, "a").await;
        let (bus_b, mut events_b, addr_b) = new_bus(&net, "b").await;

        let (ra, rb) = tokio::join!(
            bus_a.connect(EndPointAddr::new("b", addr_b)),
            bus_b.connect(EndPointAddr::new("a", addr_a)),
        );
        ra.unwrap();
        rb.unwrap();

        await_active(&bus_a, "b").await;
        await_active(&bus_b, "a").await;

        assert_eq!(bus_a.ctx.connections.load().len(), 1);
        assert_eq!(bus_b.ctx.connections.load().len(), 1);

        // the surviving transport carries traffic in both directions
        bus_a.send("b", Bytes::from_static(b"from a"), None).await.unwrap();
        bus_b.send("a", Bytes::from_static(b"from b"), None).await.unwrap();

        let at_b = collect_until(&mut events_b, |e|
            matches!(e, BusEvent::Message { payload, .. } if payload.to_vec() == b"from a")).await;
        let at_a = collect_until(&mut events_a, |e|
            matches!(e, BusEvent::Message { payload, .. } if payload.to_vec() == b"from b")).await;
        assert_no_disconnect(&at_a);
        assert_no_disconnect(&at_b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_connect_is_benign() {
        let net = MemoryNet::new();
        let (bus_a, mut events_a, _) = new_bus(&net, "a").await;
        let (_bus_b, _events_b, addr_b) = new_bus(&net, "b").await;

        bus_a.connect(EndPointAddr::new("b", addr_b)).await.unwrap();
        bus_a.connect(EndPointAddr::new("b", addr_b)).await.unwrap();
        await_active(&bus_a, "b").await;

        let connects = drain_events(&mut events_a).iter()
            .filter(|e| matches!(e, BusEvent::Connect { .. }))
            .count();
        assert_eq!(connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_frame_migrates_and_never_delivers_payload() {
        let net = MemoryNet::new();
        let (bus_a, mut events_a, _) = new_bus(&net, "a").await;
        let (_bus_b, mut events_b, addr_b) = new_bus(&net, "b").await;

        bus_a.connect(EndPointAddr::new("b", addr_b)).await.unwrap();
        bus_a.send("b", Bytes::from_static(b"first"), Some(1)).await.unwrap();
        collect_until(&mut events_a, |e| matches!(e, BusEvent::Receipt { .. })).await;

        net.corrupt_next_write();
        bus_a.send("b", Bytes::from_static(b"second"), Some(2)).await.unwrap();

        let at_b = collect_until(&mut events_b, |e|
            matches!(e, BusEvent::Message { payload, .. } if payload.to_vec() == b"second")).await;
        assert_eq!(received_messages(&at_b), vec![b"first".to_vec(), b"second".to_vec()],
            "the corrupted frame's payload must never reach the application");

        let at_a = collect_until(&mut events_a, |e|
            matches!(e, BusEvent::Receipt { receipt, .. } if *receipt == 2)).await;
        assert_no_disconnect(&at_a);
        assert_no_disconnect(&at_b);
        assert!(bus_a.connection("b").unwrap().migrations() >= 1,
            "an integrity fault must route through migration");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_exhausts_attempts_and_disconnects() {
        let net = MemoryNet::new();
        let mut config = BusConfig::default_for("a", SocketAddr::from(([127, 0, 0, 1], 0)));
        config.reconnect_backoff_delay = Duration::from_millis(10);
        config.max_reconnect_attempts = Some(2);
        let (bus_a, mut events_a) = SocketBus::new(config, net.clone()).unwrap();
        bus_a.open().await.unwrap();

        // nobody listens on this address
        bus_a.connect(EndPointAddr::new("ghost", SocketAddr::from(([127, 0, 0, 1], 59999)))).await.unwrap();

        let at_a = collect_until(&mut events_a, |e| matches!(e, BusEvent::Disconnect { .. })).await;
        match at_a.last().unwrap() {
            BusEvent::Disconnect { peer, cause: Some(BusError::Transport(_)) } => {
                assert_eq!(peer.name(), "ghost");
            }
            other => panic!("unexpected event {:?}", other),
        }

        bus_a.release("ghost");
        collect_until(&mut events_a, |e| matches!(e, BusEvent::Release { .. })).await;
        assert!(bus_a.connection("ghost").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drains_connections_and_emits_close() {
        let net = MemoryNet::new();
        let (bus_a, mut events_a, _) = new_bus(&net, "a").await;
        let (_bus_b, _events_b, addr_b) = new_bus(&net, "b").await;

        bus_a.connect(EndPointAddr::new("b", addr_b)).await.unwrap();
        await_active(&bus_a, "b").await;

        bus_a.close().await;
        assert_eq!(bus_a.state(), BusState::Closed);

        let events = drain_events(&mut events_a);
        assert!(events.iter().any(|e| matches!(e, BusEvent::Disconnect { peer, .. } if peer.name() == "b")));
        assert!(events.iter().any(|e| matches!(e, BusEvent::Release { peer } if peer.name() == "b")));
        assert!(matches!(events.last().unwrap(), BusEvent::Close { .. }));

        assert!(bus_a.connect(EndPointAddr::new("b", addr_b)).await.is_err());
        bus_a.close().await; // idempotent
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_unknown_peer_fails() {
        let net = MemoryNet::new();
        let (bus_a, _events_a, _) = new_bus(&net, "a").await;
        assert!(bus_a.send("nobody", Bytes::from_static(b"x"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_open_requires_initial_state() {
        let net = MemoryNet::new();
        let (bus, _events, _) = new_bus(&net, "a").await;
        assert!(bus.open().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_listen_failure_propagates() {
        let mut factory = MockTransportFactory::new();
        factory.expect_listen()
            .returning(|_| Err(std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken")));

        let config = BusConfig::default_for("a", SocketAddr::from(([127, 0, 0, 1], 7777)));
        let (bus, _events) = SocketBus::new(config, Arc::new(factory)).unwrap();
        assert!(bus.open().await.is_err());
    }
}
