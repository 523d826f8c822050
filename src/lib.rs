pub mod buffer_pool;
pub mod config;
pub mod device;
pub mod eal;
pub mod error;
pub mod forwarder;
pub mod link;
pub mod port;
pub mod ring_device;
pub mod shutdown;
pub mod sim;
pub mod stats;
pub mod threading;
pub mod worker;

// Re-export for easier testing
pub use buffer_pool::{Mbuf, MbufPool};
pub use config::{ForwarderConfig, PollPolicy, StatsFormat};
pub use device::{EthDevice, LinkStatus, MacAddr};
pub use error::{DeviceError, FatalError, PoolError, PortError};
pub use forwarder::{validate_port_count, Forwarder, ShutdownOutcome};
pub use ring_device::RingDevice;
pub use shutdown::{ShutdownController, ShutdownState};
pub use worker::{pair, ForwardingWorker};
