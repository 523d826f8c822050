//! Port lifecycle: configuration, queue setup and start.
//!
//! Every port gets exactly one receive and one transmit queue. Descriptor counts that fall outside
//! what the driver supports are clamped rather than rejected. Any failure is fatal for startup: a
//! half-initialised port set cannot forward safely, so [`PortManager::init_all`] stops at the
//! first failing port and reports it.

use crate::buffer_pool::MbufPool;
use crate::config::QueueConfig;
use crate::device::{EthDevice, MacAddr};
use crate::error::{FatalError, PortError};
use std::sync::Arc;
use tracing::{debug, info};

/// Descriptor counts actually applied to a port after driver adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    pub rx_desc: u16,
    pub tx_desc: u16,
}

/// Owns port configuration until the ports are started and handed to workers.
pub struct PortManager {
    device: Arc<dyn EthDevice>,
    queues: QueueConfig,
}

impl PortManager {
    pub fn new(device: Arc<dyn EthDevice>, queues: QueueConfig) -> Self {
        Self { device, queues }
    }

    pub fn port_count(&self) -> u16 {
        self.device.port_count()
    }

    fn check_port(&self, port: u16) -> Result<(), PortError> {
        let count = self.device.port_count();
        if port >= count {
            return Err(PortError::InvalidPort { port, count });
        }
        Ok(())
    }

    /// Configure the device and set up its receive and transmit queues.
    ///
    /// Receive descriptors are backed by buffers from `pool`.
    pub fn configure(&self, port: u16, pool: &MbufPool) -> Result<QueueLayout, PortError> {
        self.check_port(port)?;
        let q = &self.queues;

        self.device
            .configure(port, q.rx_queues, q.tx_queues, &q.port_conf)
            .map_err(|source| PortError::Configure { port, source })?;

        let mut rx_desc = q.rx_desc;
        let mut tx_desc = q.tx_desc;
        self.device
            .adjust_descriptor_counts(port, &mut rx_desc, &mut tx_desc)
            .map_err(|source| PortError::DescriptorAdjust { port, source })?;
        if rx_desc != q.rx_desc || tx_desc != q.tx_desc {
            debug!(
                port,
                requested_rx = q.rx_desc,
                requested_tx = q.tx_desc,
                rx_desc,
                tx_desc,
                "descriptor counts adjusted to driver limits"
            );
        }

        for queue in 0..q.rx_queues {
            self.device
                .setup_rx_queue(port, queue, rx_desc, pool)
                .map_err(|source| PortError::RxQueueSetup {
                    port,
                    queue,
                    source,
                })?;
        }
        for queue in 0..q.tx_queues {
            self.device
                .setup_tx_queue(port, queue, tx_desc)
                .map_err(|source| PortError::TxQueueSetup {
                    port,
                    queue,
                    source,
                })?;
        }

        Ok(QueueLayout { rx_desc, tx_desc })
    }

    pub fn start(&self, port: u16) -> Result<(), PortError> {
        self.check_port(port)?;
        self.device
            .start(port)
            .map_err(|source| PortError::Start { port, source })
    }

    /// Hardware address of a started port.
    pub fn mac_address(&self, port: u16) -> Result<MacAddr, PortError> {
        self.check_port(port)?;
        self.device
            .mac_address(port)
            .map_err(|source| PortError::Start { port, source })
    }

    /// Configure and start one port, then log its MAC address.
    pub fn init_port(&self, port: u16, pool: &MbufPool) -> Result<QueueLayout, PortError> {
        let layout = self.configure(port, pool)?;
        self.start(port)?;
        let mac = self.mac_address(port)?;
        info!(port, mac = %mac, rx_desc = layout.rx_desc, tx_desc = layout.tx_desc, "port started");
        Ok(layout)
    }

    /// Initialise every port, stopping at the first failure.
    pub fn init_all(&self, pool: &MbufPool) -> Result<Vec<QueueLayout>, FatalError> {
        (0..self.port_count())
            .map(|port| self.init_port(port, pool).map_err(FatalError::from))
            .collect()
    }
}
