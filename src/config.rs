//! Forwarder tunables.
//!
//! Defaults: 8191 buffers per port with a 250-entry per-worker cache, 128 receive and 512
//! transmit descriptors, and bursts of 32.

use crate::buffer_pool::DEFAULT_MBUF_SIZE;
use crate::device::PortConf;
use std::time::Duration;

pub const NUM_MBUFS_PER_PORT: usize = 8191;
pub const MBUF_CACHE_SIZE: usize = 250;
pub const RX_RING_SIZE: u16 = 128;
pub const TX_RING_SIZE: u16 = 512;
pub const BURST_SIZE: usize = 32;

/// Upper bound on the configurable burst size.
pub const MAX_BURST_SIZE: usize = 512;

/// How a worker behaves after a sweep that moved no frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollPolicy {
    /// Spin immediately into the next sweep. Meant for a dedicated core.
    #[default]
    BusyPoll,
    /// Sleep between idle sweeps, doubling from 1 µs up to `max`. Meant for shared cores.
    Backoff { max: Duration },
}

/// Queue layout applied to every port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub rx_queues: u16,
    pub tx_queues: u16,
    pub rx_desc: u16,
    pub tx_desc: u16,
    pub port_conf: PortConf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rx_queues: 1,
            tx_queues: 1,
            rx_desc: RX_RING_SIZE,
            tx_desc: TX_RING_SIZE,
            port_conf: PortConf::default(),
        }
    }
}

/// Buffer pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    pub mbufs_per_port: usize,
    pub cache_size: usize,
    pub mbuf_size: usize,
}

impl PoolConfig {
    /// Pool capacity needed for `port_count` ports.
    pub fn capacity_for(&self, port_count: u16) -> usize {
        self.mbufs_per_port * usize::from(port_count)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "MBUF_POOL".to_string(),
            mbufs_per_port: NUM_MBUFS_PER_PORT,
            cache_size: MBUF_CACHE_SIZE,
            mbuf_size: DEFAULT_MBUF_SIZE,
        }
    }
}

/// Output format for statistics reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsFormat {
    #[default]
    Text,
    Json,
}

/// Top-level configuration used during startup.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub queues: QueueConfig,
    pub pool: PoolConfig,
    /// Frames requested per receive call.
    pub burst_size: usize,
    pub poll_policy: PollPolicy,
    /// Scheduling priority applied to worker threads (0 leaves the default policy).
    pub worker_priority: i32,
    /// Interval of the background link watcher; `None` disables it.
    pub link_poll_interval: Option<Duration>,
    /// Interval of periodic statistics reports; `None` reports only at exit.
    pub stats_interval: Option<Duration>,
    pub stats_format: StatsFormat,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            queues: QueueConfig::default(),
            pool: PoolConfig::default(),
            burst_size: BURST_SIZE,
            poll_policy: PollPolicy::default(),
            worker_priority: 0,
            link_poll_interval: Some(Duration::from_secs(1)),
            stats_interval: None,
            stats_format: StatsFormat::default(),
        }
    }
}

impl ForwarderConfig {
    /// Burst size clamped into `1..=MAX_BURST_SIZE`.
    pub fn effective_burst_size(&self) -> usize {
        self.burst_size.clamp(1, MAX_BURST_SIZE)
    }

    /// Link watch period; a zero period disables the watcher.
    pub fn effective_link_poll_interval(&self) -> Option<Duration> {
        self.link_poll_interval.filter(|interval| !interval.is_zero())
    }

    /// Periodic report period; a zero period means report only at exit.
    pub fn effective_stats_interval(&self) -> Option<Duration> {
        self.stats_interval.filter(|interval| !interval.is_zero())
    }
}
