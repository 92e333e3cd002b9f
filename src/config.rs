use std::cmp::min;
use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

use crate::end_point::EndPointAddr;

/// Configuration of a bus instance. The defaults are meant for data-center style networks;
///  the thresholds interact (see the individual fields), so changes should be made with the
///  flow-control behavior in mind.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// canonical name of this endpoint. Peers address each other by canonical name, and the
    ///  lexicographic order of names is the tie-break for simultaneous connects, so names must
    ///  be unique across the cluster.
    pub local_name: String,

    /// the socket address this bus binds its listener to
    pub bind_addr: SocketAddr,

    /// capacity of the pooled read buffers. Larger buffers mean fewer socket reads per message
    ///  but more memory held per connection while messages are undisposed.
    pub read_buf_size: usize,

    /// number of read buffers retained in the pool; buffers beyond this are discarded on release
    pub buffer_pool_size: usize,

    /// enable per-frame header/body checksums (protocol version 5 and above). Peers with
    ///  checksums disabled write 0 which the receiving side treats as 'not present'.
    pub crc_enabled: bool,

    /// assumed path MTU; together with `auto_flush_mtu_factor` and the socket send buffer it
    ///  determines the auto-flush threshold
    pub mtu: usize,

    /// auto-flush once more than `mtu * auto_flush_mtu_factor` unflushed bytes are queued
    pub auto_flush_mtu_factor: usize,

    /// socket send buffer size; also the reference point for the backlog-excessive threshold.
    pub socket_send_buffer_size: usize,

    /// socket receive buffer size
    pub socket_receive_buffer_size: usize,

    /// request a forced acknowledgement once this many unacknowledged bytes have accumulated,
    ///  bounding resend-queue growth on connections with few natural receipts
    pub force_ack_threshold: usize,

    /// throttle reads once undisposed inbound event bytes exceed this
    pub read_throttle_threshold: usize,

    /// number of concurrent writer threads up to which a flush writes directly on the calling
    ///  thread; beyond it, batches are handed to the connection's writer task
    pub direct_write_thread_threshold: u32,

    /// a handshake not completed within this time is abandoned and its transport closed
    pub handshake_timeout: Duration,

    /// interval of the periodic flush sweeping connections marked pending-flush
    pub flush_interval: Duration,

    /// interval of the connection health check
    pub health_check_interval: Duration,

    /// base time to wait for acknowledgement progress before an unhealthy connection migrates.
    ///  Escalates per consecutive migration against the same pending receipt, capped at
    ///  `ack_timeout_escalation_cap` times this value.
    pub ack_timeout: Duration,

    /// cap of the ack timeout escalation multiplier
    pub ack_timeout_escalation_cap: u32,

    /// hard limit: an unhealthy connection is disconnected outright (migration-eligible or
    ///  not) once no progress was made for this long
    pub fatal_timeout: Duration,

    /// delay before a reconnect attempt during migration
    pub reconnect_delay: Duration,

    /// longer delay used after a first-attempt connect failure or after losing the
    ///  simultaneous-connect tie-break, to damp connect churn
    pub reconnect_backoff_delay: Duration,

    /// consecutive failed reconnect attempts after which the connection is torn down instead
    ///  of migrated again. `None` retries indefinitely.
    pub max_reconnect_attempts: Option<u32>,

    /// consecutive migrations against the same pending receipt after which the peer is asked
    ///  for a one-time diagnostic capture
    pub migration_limit_before_dump: u32,
}

impl BusConfig {
    pub fn default_for(local_name: impl Into<String>, bind_addr: SocketAddr) -> BusConfig {
        BusConfig {
            local_name: local_name.into(),
            bind_addr,
            read_buf_size: 64 * 1024,
            buffer_pool_size: 1024,
            crc_enabled: true,
            mtu: 1500,
            auto_flush_mtu_factor: 32,
            socket_send_buffer_size: 2 * 1024 * 1024,
            socket_receive_buffer_size: 2 * 1024 * 1024,
            force_ack_threshold: 8 * 1024 * 1024,
            read_throttle_threshold: 16 * 1024 * 1024,
            direct_write_thread_threshold: 4,
            handshake_timeout: Duration::from_secs(10),
            flush_interval: Duration::from_millis(10),
            health_check_interval: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(10),
            ack_timeout_escalation_cap: 4,
            fatal_timeout: Duration::from_secs(120),
            reconnect_delay: Duration::from_millis(200),
            reconnect_backoff_delay: Duration::from_secs(1),
            max_reconnect_attempts: Some(8),
            migration_limit_before_dump: 4,
        }
    }

    pub fn local_end_point(&self) -> EndPointAddr {
        EndPointAddr::new(self.local_name.clone(), self.bind_addr)
    }

    /// unflushed bytes above which a send triggers an immediate flush instead of waiting for
    ///  the periodic one - batches small messages while bounding latency
    pub fn auto_flush_threshold(&self) -> usize {
        min(self.mtu * self.auto_flush_mtu_factor, self.socket_send_buffer_size)
    }

    /// queued bytes above which BACKLOG_EXCESSIVE is emitted; approximated to the transport's
    ///  send buffer size. BACKLOG_NORMAL follows only after receding below half of this.
    pub fn backlog_excessive_threshold(&self) -> usize {
        self.socket_send_buffer_size
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_name.is_empty() {
            bail!("local name must not be empty");
        }
        if self.read_buf_size < 64 {
            bail!("read buffer size is too small");
        }
        if self.mtu < 576 {
            bail!("MTU is implausibly small");
        }
        if self.ack_timeout_escalation_cap == 0 {
            bail!("ack timeout escalation cap must be at least 1");
        }
        if self.fatal_timeout < self.ack_timeout {
            bail!("fatal timeout must not be shorter than the ack timeout");
        }
        Ok(())
    }
}
