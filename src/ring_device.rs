//! In-memory poll-mode driver.
//!
//! Every port gets one receive ring and one transmit ring, each a bounded crossbeam channel sized
//! to the descriptor count chosen at queue setup. The "wire" side of a port is exposed through
//! [`RingDevice::inject`] (a frame arrives and is written into a pool buffer, as a NIC would DMA it
//! into a posted receive descriptor) and [`RingDevice::drain_tx`] (the NIC finished sending the
//! frames sitting in the transmit ring). The forwarder sees nothing but the [`EthDevice`] trait.
//!
//! A handful of fault hooks (`set_tx_budget`, `fail_next_rx`, `fail_next_tx`, `set_fault`) let
//! tests drive the partial-accept and failure paths deterministically, and call counters make it
//! possible to check that workers stop touching queues after cancellation.

use crate::buffer_pool::{Mbuf, MbufPool};
use crate::device::{DescLimits, EthDevice, EthStats, LinkStatus, MacAddr, PortConf};
use crate::error::DeviceError;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// `-EIO`, reported by a burst call armed with [`RingDevice::fail_next_rx`] or
/// [`RingDevice::fail_next_tx`].
const EIO: i32 = -5;

/// Link state reported for every port until a test says otherwise.
const DEFAULT_LINK: LinkStatus = LinkStatus {
    up: true,
    speed_mbps: 10_000,
};

/// Lifecycle step a port can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Configure,
    RxQueueSetup,
    TxQueueSetup,
    Start,
}

struct Ring {
    producer: Sender<Mbuf>,
    consumer: Receiver<Mbuf>,
}

impl Ring {
    fn new(nb_desc: u16) -> Self {
        let (producer, consumer) = bounded(usize::from(nb_desc));
        Self { producer, consumer }
    }

    fn free_slots(&self) -> usize {
        self.producer
            .capacity()
            .unwrap_or(usize::MAX)
            .saturating_sub(self.producer.len())
    }
}

#[derive(Debug, Default)]
struct PortSetup {
    configured: bool,
    conf: PortConf,
    fault: Option<Fault>,
}

struct SimPort {
    id: u16,
    mac: MacAddr,
    setup: Mutex<PortSetup>,
    link: Mutex<LinkStatus>,
    started: AtomicBool,
    rx_ring: OnceLock<Ring>,
    rx_pool: OnceLock<MbufPool>,
    tx_ring: OnceLock<Ring>,
    /// Upper bound on buffers accepted per transmit call; `usize::MAX` means unlimited.
    tx_budget: AtomicUsize,
    fail_next_rx: AtomicBool,
    fail_next_tx: AtomicBool,
    ipackets: AtomicU64,
    opackets: AtomicU64,
    imissed: AtomicU64,
}

impl SimPort {
    fn new(id: u16) -> Self {
        let [hi, lo] = id.to_be_bytes();
        Self {
            id,
            mac: MacAddr([0x02, 0x00, 0x00, 0x00, hi, lo]),
            setup: Mutex::new(PortSetup::default()),
            link: Mutex::new(DEFAULT_LINK),
            started: AtomicBool::new(false),
            rx_ring: OnceLock::new(),
            rx_pool: OnceLock::new(),
            tx_ring: OnceLock::new(),
            tx_budget: AtomicUsize::new(usize::MAX),
            fail_next_rx: AtomicBool::new(false),
            fail_next_tx: AtomicBool::new(false),
            ipackets: AtomicU64::new(0),
            opackets: AtomicU64::new(0),
            imissed: AtomicU64::new(0),
        }
    }

    fn check_fault(&self, step: Fault) -> Result<(), DeviceError> {
        if self.setup.lock().fault == Some(step) {
            return Err(DeviceError::Driver {
                port: self.id,
                code: EIO,
            });
        }
        Ok(())
    }

    fn ensure_started(&self) -> Result<(), DeviceError> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DeviceError::NotStarted(self.id))
        }
    }
}

/// Software driver with `port_count` independent ports.
pub struct RingDevice {
    ports: Vec<SimPort>,
    limits: DescLimits,
    rx_calls: AtomicU64,
    tx_calls: AtomicU64,
    release_calls: AtomicU64,
}

impl RingDevice {
    pub fn new(port_count: u16, limits: DescLimits) -> Self {
        Self {
            ports: (0..port_count).map(SimPort::new).collect(),
            limits,
            rx_calls: AtomicU64::new(0),
            tx_calls: AtomicU64::new(0),
            release_calls: AtomicU64::new(0),
        }
    }

    fn port(&self, port: u16) -> Result<&SimPort, DeviceError> {
        self.ports
            .get(usize::from(port))
            .ok_or(DeviceError::NoSuchPort(port))
    }

    fn queue_zero(port: u16, queue: u16) -> Result<(), DeviceError> {
        if queue == 0 {
            Ok(())
        } else {
            Err(DeviceError::QueueNotReady { port, queue })
        }
    }

    /// Deliver a frame from the wire into `port`'s receive ring.
    ///
    /// Returns `false` when the frame was dropped: the port is not running, the frame exceeds the
    /// configured maximum length, the pool is exhausted or the ring is full. The last three count
    /// towards the port's `imissed` counter.
    pub fn inject(&self, port: u16, frame: &[u8]) -> bool {
        let Ok(sim) = self.port(port) else {
            return false;
        };
        if !sim.started.load(Ordering::Acquire) {
            return false;
        }
        let (Some(ring), Some(pool)) = (sim.rx_ring.get(), sim.rx_pool.get()) else {
            return false;
        };
        let max_len = sim.setup.lock().conf.max_rx_pkt_len as usize;
        if frame.len() > max_len {
            sim.imissed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Some(mut mbuf) = pool.alloc() else {
            sim.imissed.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        mbuf.set_data(frame);
        mbuf.set_port(port);
        match ring.producer.try_send(mbuf) {
            Ok(()) => true,
            Err(_) => {
                sim.imissed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Take every frame the port has transmitted so far, oldest first.
    pub fn drain_tx(&self, port: u16) -> Vec<Mbuf> {
        self.port(port)
            .ok()
            .and_then(|sim| sim.tx_ring.get())
            .map(|ring| ring.consumer.try_iter().collect())
            .unwrap_or_default()
    }

    /// Frames waiting in the transmit ring.
    pub fn tx_pending(&self, port: u16) -> usize {
        self.port(port)
            .ok()
            .and_then(|sim| sim.tx_ring.get())
            .map(|ring| ring.consumer.len())
            .unwrap_or(0)
    }

    /// Frames waiting in the receive ring.
    pub fn rx_pending(&self, port: u16) -> usize {
        self.port(port)
            .ok()
            .and_then(|sim| sim.rx_ring.get())
            .map(|ring| ring.consumer.len())
            .unwrap_or(0)
    }

    pub fn set_link(&self, port: u16, status: LinkStatus) {
        if let Ok(sim) = self.port(port) {
            *sim.link.lock() = status;
        }
    }

    /// Cap the number of buffers a single transmit call on `port` accepts.
    pub fn set_tx_budget(&self, port: u16, budget: Option<usize>) {
        if let Ok(sim) = self.port(port) {
            sim.tx_budget
                .store(budget.unwrap_or(usize::MAX), Ordering::Relaxed);
        }
    }

    /// Make the next receive call on `port` fail.
    pub fn fail_next_rx(&self, port: u16) {
        if let Ok(sim) = self.port(port) {
            sim.fail_next_rx.store(true, Ordering::Relaxed);
        }
    }

    /// Make the next transmit call on `port` fail without taking any buffer.
    pub fn fail_next_tx(&self, port: u16) {
        if let Ok(sim) = self.port(port) {
            sim.fail_next_tx.store(true, Ordering::Relaxed);
        }
    }

    /// Make a lifecycle step of `port` fail.
    pub fn set_fault(&self, port: u16, fault: Option<Fault>) {
        if let Ok(sim) = self.port(port) {
            sim.setup.lock().fault = fault;
        }
    }

    pub fn is_started(&self, port: u16) -> bool {
        self.port(port)
            .map(|sim| sim.started.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn rx_calls(&self) -> u64 {
        self.rx_calls.load(Ordering::Relaxed)
    }

    pub fn tx_calls(&self) -> u64 {
        self.tx_calls.load(Ordering::Relaxed)
    }

    pub fn release_calls(&self) -> u64 {
        self.release_calls.load(Ordering::Relaxed)
    }
}

impl EthDevice for RingDevice {
    fn port_count(&self) -> u16 {
        self.ports.len() as u16
    }

    fn dev_info(&self, port: u16) -> Result<DescLimits, DeviceError> {
        self.port(port).map(|_| self.limits)
    }

    fn configure(
        &self,
        port: u16,
        rx_queues: u16,
        tx_queues: u16,
        conf: &PortConf,
    ) -> Result<(), DeviceError> {
        let sim = self.port(port)?;
        sim.check_fault(Fault::Configure)?;
        if rx_queues != 1 || tx_queues != 1 {
            return Err(DeviceError::InvalidArgument(format!(
                "port {port} supports exactly one rx and one tx queue"
            )));
        }
        let mut setup = sim.setup.lock();
        setup.configured = true;
        setup.conf = *conf;
        Ok(())
    }

    fn setup_rx_queue(
        &self,
        port: u16,
        queue: u16,
        nb_desc: u16,
        pool: &MbufPool,
    ) -> Result<(), DeviceError> {
        let sim = self.port(port)?;
        Self::queue_zero(port, queue)?;
        sim.check_fault(Fault::RxQueueSetup)?;
        if !sim.setup.lock().configured {
            return Err(DeviceError::InvalidArgument(format!(
                "port {port} must be configured before queue setup"
            )));
        }
        if nb_desc == 0 {
            return Err(DeviceError::InvalidArgument("zero rx descriptors".into()));
        }
        sim.rx_ring.set(Ring::new(nb_desc)).map_err(|_| {
            DeviceError::InvalidArgument(format!("rx queue {queue} of port {port} already set up"))
        })?;
        let _ = sim.rx_pool.set(pool.clone());
        Ok(())
    }

    fn setup_tx_queue(&self, port: u16, queue: u16, nb_desc: u16) -> Result<(), DeviceError> {
        let sim = self.port(port)?;
        Self::queue_zero(port, queue)?;
        sim.check_fault(Fault::TxQueueSetup)?;
        if !sim.setup.lock().configured {
            return Err(DeviceError::InvalidArgument(format!(
                "port {port} must be configured before queue setup"
            )));
        }
        if nb_desc == 0 {
            return Err(DeviceError::InvalidArgument("zero tx descriptors".into()));
        }
        sim.tx_ring.set(Ring::new(nb_desc)).map_err(|_| {
            DeviceError::InvalidArgument(format!("tx queue {queue} of port {port} already set up"))
        })
    }

    fn start(&self, port: u16) -> Result<(), DeviceError> {
        let sim = self.port(port)?;
        sim.check_fault(Fault::Start)?;
        if sim.rx_ring.get().is_none() {
            return Err(DeviceError::QueueNotReady { port, queue: 0 });
        }
        if sim.tx_ring.get().is_none() {
            return Err(DeviceError::QueueNotReady { port, queue: 0 });
        }
        sim.started.store(true, Ordering::Release);
        Ok(())
    }

    fn mac_address(&self, port: u16) -> Result<MacAddr, DeviceError> {
        self.port(port).map(|sim| sim.mac)
    }

    fn link_status(&self, port: u16) -> Result<LinkStatus, DeviceError> {
        self.port(port).map(|sim| *sim.link.lock())
    }

    fn rx_burst(
        &self,
        port: u16,
        queue: u16,
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> Result<usize, DeviceError> {
        self.rx_calls.fetch_add(1, Ordering::Relaxed);
        let sim = self.port(port)?;
        Self::queue_zero(port, queue)?;
        sim.ensure_started()?;
        if sim.fail_next_rx.swap(false, Ordering::Relaxed) {
            return Err(DeviceError::Driver { port, code: EIO });
        }
        let ring = sim
            .rx_ring
            .get()
            .ok_or(DeviceError::QueueNotReady { port, queue })?;

        let mut received = 0;
        while received < max {
            match ring.consumer.try_recv() {
                Ok(mbuf) => {
                    out.push(mbuf);
                    received += 1;
                }
                Err(_) => break,
            }
        }
        sim.ipackets.fetch_add(received as u64, Ordering::Relaxed);
        Ok(received)
    }

    fn tx_burst(
        &self,
        port: u16,
        queue: u16,
        bufs: &mut Vec<Mbuf>,
    ) -> Result<usize, DeviceError> {
        self.tx_calls.fetch_add(1, Ordering::Relaxed);
        let sim = self.port(port)?;
        Self::queue_zero(port, queue)?;
        sim.ensure_started()?;
        if sim.fail_next_tx.swap(false, Ordering::Relaxed) {
            return Err(DeviceError::Driver { port, code: EIO });
        }
        let ring = sim
            .tx_ring
            .get()
            .ok_or(DeviceError::QueueNotReady { port, queue })?;

        // Only the owning worker produces into this ring, so free slots can only grow while the
        // burst is being pushed.
        let offered = bufs
            .len()
            .min(ring.free_slots())
            .min(sim.tx_budget.load(Ordering::Relaxed));

        let mut accepted = 0;
        let mut spill = Vec::new();
        for mbuf in bufs.drain(..offered) {
            if !spill.is_empty() {
                spill.push(mbuf);
                continue;
            }
            match ring.producer.try_send(mbuf) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(mbuf)) | Err(TrySendError::Disconnected(mbuf)) => {
                    spill.push(mbuf)
                }
            }
        }
        if !spill.is_empty() {
            bufs.splice(0..0, spill);
        }

        sim.opackets.fetch_add(accepted as u64, Ordering::Relaxed);
        Ok(accepted)
    }

    fn release(&self, mbuf: Mbuf) {
        self.release_calls.fetch_add(1, Ordering::Relaxed);
        mbuf.release();
    }

    fn stats(&self, port: u16) -> Result<EthStats, DeviceError> {
        let sim = self.port(port)?;
        Ok(EthStats {
            ipackets: sim.ipackets.load(Ordering::Relaxed),
            opackets: sim.opackets.load(Ordering::Relaxed),
            imissed: sim.imissed.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::DEFAULT_MBUF_SIZE;

    fn started(ports: u16, pool: &MbufPool, nb_desc: u16) -> RingDevice {
        let dev = RingDevice::new(ports, DescLimits::default());
        for port in 0..ports {
            dev.configure(port, 1, 1, &PortConf::default()).unwrap();
            dev.setup_rx_queue(port, 0, nb_desc, pool).unwrap();
            dev.setup_tx_queue(port, 0, nb_desc).unwrap();
            dev.start(port).unwrap();
        }
        dev
    }

    #[test]
    fn inject_before_start_is_ignored() {
        let dev = RingDevice::new(2, DescLimits::default());
        assert!(!dev.inject(0, b"frame"));
        assert_eq!(dev.stats(0).unwrap(), EthStats::default());
    }

    #[test]
    fn full_rx_ring_counts_missed_frames() {
        let pool = MbufPool::create("t", 64, 0, DEFAULT_MBUF_SIZE).unwrap();
        let dev = started(2, &pool, 4);
        for _ in 0..6 {
            dev.inject(0, b"x");
        }
        assert_eq!(dev.rx_pending(0), 4);
        assert_eq!(dev.stats(0).unwrap().imissed, 2);
        assert_eq!(pool.in_use(), 4);
    }

    #[test]
    fn tx_burst_respects_ring_space_and_order() {
        let pool = MbufPool::create("t", 64, 0, DEFAULT_MBUF_SIZE).unwrap();
        let dev = started(2, &pool, 8);
        let mut bufs = Vec::new();
        for i in 0..10u8 {
            let mut m = pool.alloc().unwrap();
            m.set_data(&[i]);
            bufs.push(m);
        }
        let accepted = dev.tx_burst(1, 0, &mut bufs).unwrap();
        assert_eq!(accepted, 8);
        assert_eq!(bufs.len(), 2);
        assert_eq!(bufs[0].data(), &[8]);
        let sent: Vec<u8> = dev.drain_tx(1).iter().map(|m| m.data()[0]).collect();
        assert_eq!(sent, (0..8).collect::<Vec<u8>>());
    }

    #[test]
    fn queue_setup_requires_configure() {
        let pool = MbufPool::create("t", 8, 0, DEFAULT_MBUF_SIZE).unwrap();
        let dev = RingDevice::new(2, DescLimits::default());
        assert!(dev.setup_rx_queue(0, 0, 32, &pool).is_err());
        assert!(dev.start(0).is_err());
    }

    #[test]
    fn armed_rx_failure_fires_once() {
        let pool = MbufPool::create("t", 8, 0, DEFAULT_MBUF_SIZE).unwrap();
        let dev = started(2, &pool, 8);
        dev.fail_next_rx(0);
        let mut out = Vec::new();
        assert!(dev.rx_burst(0, 0, &mut out, 32).is_err());
        assert_eq!(dev.rx_burst(0, 0, &mut out, 32), Ok(0));
    }

    #[test]
    fn armed_tx_failure_keeps_the_burst() {
        let pool = MbufPool::create("t", 8, 0, DEFAULT_MBUF_SIZE).unwrap();
        let dev = started(2, &pool, 8);
        let mut bufs = Vec::new();
        pool.alloc_bulk(3, &mut bufs);
        dev.fail_next_tx(1);

        assert_eq!(
            dev.tx_burst(1, 0, &mut bufs),
            Err(DeviceError::Driver { port: 1, code: EIO })
        );
        assert_eq!(bufs.len(), 3);
        assert_eq!(dev.stats(1).unwrap().opackets, 0);
        assert_eq!(dev.tx_burst(1, 0, &mut bufs), Ok(3));
        assert!(bufs.is_empty());
    }
}
