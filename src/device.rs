//! Poll-mode driver interface consumed by the forwarder.
//!
//! The forwarder never talks to hardware directly. Everything it needs from a NIC driver (queue
//! setup, link state, burst receive/transmit, counters) goes through [`EthDevice`], so the same
//! port manager and worker loop run against a real driver binding or the in-memory
//! [`RingDevice`](crate::ring_device::RingDevice).

use crate::buffer_pool::{Mbuf, MbufPool};
use crate::error::DeviceError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest standard Ethernet frame, including the FCS.
pub const ETHER_MAX_LEN: u32 = 1518;

/// Device-wide configuration applied by `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConf {
    pub max_rx_pkt_len: u32,
}

impl Default for PortConf {
    fn default() -> Self {
        Self {
            max_rx_pkt_len: ETHER_MAX_LEN,
        }
    }
}

/// Descriptor ring limits advertised by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescLimits {
    pub rx_min: u16,
    pub rx_max: u16,
    pub tx_min: u16,
    pub tx_max: u16,
    /// Descriptor counts must be a multiple of this value.
    pub align: u16,
}

impl Default for DescLimits {
    fn default() -> Self {
        Self {
            rx_min: 32,
            rx_max: 4096,
            tx_min: 32,
            tx_max: 4096,
            align: 8,
        }
    }
}

impl DescLimits {
    /// Clamp into `min..=max`, then move to a multiple of `align` that stays inside the range.
    /// When the range holds no multiple of `align`, the clamped value is returned unaligned.
    fn clamp(value: u16, min: u16, max: u16, align: u16) -> u16 {
        let value = value.clamp(min, max);
        if align <= 1 || value % align == 0 {
            return value;
        }
        let up = u32::from(value / align + 1) * u32::from(align);
        if up <= u32::from(max) {
            return up as u16;
        }
        let down = value - value % align;
        if down >= min && down > 0 {
            return down;
        }
        value
    }

    pub fn clamp_rx(&self, value: u16) -> u16 {
        Self::clamp(value, self.rx_min, self.rx_max, self.align)
    }

    pub fn clamp_tx(&self, value: u16) -> u16 {
        Self::clamp(value, self.tx_min, self.tx_max, self.align)
    }
}

/// Physical link snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkStatus {
    pub up: bool,
    pub speed_mbps: u32,
}

impl LinkStatus {
    pub const DOWN: LinkStatus = LinkStatus {
        up: false,
        speed_mbps: 0,
    };

    pub fn up(speed_mbps: u32) -> Self {
        Self {
            up: true,
            speed_mbps,
        }
    }
}

/// 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x} {:02x} {:02x} {:02x} {:02x} {:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Basic per-port counters maintained by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EthStats {
    /// Frames handed to the application by receive calls.
    pub ipackets: u64,
    /// Frames accepted by transmit calls.
    pub opackets: u64,
    /// Frames the hardware dropped for lack of a free receive descriptor.
    pub imissed: u64,
}

/// Operations a poll-mode driver exposes to the forwarder.
///
/// Receive, transmit and release never block. Only one execution context may drive a given
/// queue at a time; the forwarder guarantees this by giving every port to exactly one worker.
pub trait EthDevice: Send + Sync {
    /// Number of ports the driver probed.
    fn port_count(&self) -> u16;

    fn dev_info(&self, port: u16) -> Result<DescLimits, DeviceError>;

    fn configure(
        &self,
        port: u16,
        rx_queues: u16,
        tx_queues: u16,
        conf: &PortConf,
    ) -> Result<(), DeviceError>;

    /// Clamp the requested descriptor counts into the driver's supported range.
    fn adjust_descriptor_counts(
        &self,
        port: u16,
        nb_rxd: &mut u16,
        nb_txd: &mut u16,
    ) -> Result<(), DeviceError> {
        let limits = self.dev_info(port)?;
        *nb_rxd = limits.clamp_rx(*nb_rxd);
        *nb_txd = limits.clamp_tx(*nb_txd);
        Ok(())
    }

    /// Allocate the receive ring; its descriptors are filled from `pool`.
    fn setup_rx_queue(
        &self,
        port: u16,
        queue: u16,
        nb_desc: u16,
        pool: &MbufPool,
    ) -> Result<(), DeviceError>;

    fn setup_tx_queue(&self, port: u16, queue: u16, nb_desc: u16) -> Result<(), DeviceError>;

    fn start(&self, port: u16) -> Result<(), DeviceError>;

    fn mac_address(&self, port: u16) -> Result<MacAddr, DeviceError>;

    fn link_status(&self, port: u16) -> Result<LinkStatus, DeviceError>;

    /// Append up to `max` received buffers to `out` and return how many were added.
    fn rx_burst(
        &self,
        port: u16,
        queue: u16,
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> Result<usize, DeviceError>;

    /// Take buffers from the front of `bufs` for transmission, in order, and return how many
    /// were accepted. Buffers that were not accepted stay in `bufs`.
    fn tx_burst(&self, port: u16, queue: u16, bufs: &mut Vec<Mbuf>)
        -> Result<usize, DeviceError>;

    /// Give an unsent buffer back to its pool.
    fn release(&self, mbuf: Mbuf) {
        mbuf.release();
    }

    fn stats(&self, port: u16) -> Result<EthStats, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_counts_clamp_and_align() {
        let limits = DescLimits {
            rx_min: 64,
            rx_max: 1024,
            tx_min: 64,
            tx_max: 1000,
            align: 32,
        };
        assert_eq!(limits.clamp_rx(16), 64);
        assert_eq!(limits.clamp_rx(128), 128);
        assert_eq!(limits.clamp_rx(100), 128);
        assert_eq!(limits.clamp_rx(9000), 1024);
        assert_eq!(limits.clamp_tx(990), 992);
        assert_eq!(limits.clamp_tx(999), 992);
    }

    #[test]
    fn alignment_never_leaves_the_supported_range() {
        let narrow = DescLimits {
            rx_min: 100,
            rx_max: 120,
            tx_min: 10,
            tx_max: 20,
            align: 64,
        };
        // No multiple of 64 fits: keep the clamped value rather than dropping below min.
        assert_eq!(narrow.clamp_rx(110), 110);
        assert_eq!(narrow.clamp_tx(15), 15);
        assert_eq!(narrow.clamp_tx(0), 10);

        let tight = DescLimits {
            rx_min: 60,
            rx_max: 100,
            tx_min: 1,
            tx_max: u16::MAX,
            align: 64,
        };
        assert_eq!(tight.clamp_rx(90), 64);
        assert_eq!(tight.clamp_tx(u16::MAX), u16::MAX - u16::MAX % 64);
        assert_eq!(tight.clamp_tx(1), 64);
    }

    #[test]
    fn mac_renders_as_spaced_hex() {
        let mac = MacAddr([0x02, 0, 0, 0xab, 0x0c, 0x01]);
        assert_eq!(mac.to_string(), "02 00 00 ab 0c 01");
    }
}
