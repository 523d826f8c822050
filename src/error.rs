//! Error taxonomy.
//!
//! Only two tiers exist. Startup failures are [`FatalError`]s that abort the process with a
//! message naming the failing step; everything that can happen inside the forwarding loop is
//! absorbed locally and never surfaces as an error type.

use thiserror::Error;

/// Failure reported by the driver for a single device operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("port {0} does not exist")]
    NoSuchPort(u16),
    #[error("queue {queue} on port {port} is not set up")]
    QueueNotReady { port: u16, queue: u16 },
    #[error("port {0} is not started")]
    NotStarted(u16),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("driver error {code} on port {port}")]
    Driver { port: u16, code: i32 },
}

/// Buffer pool creation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool {0} must hold at least one element")]
    ZeroCapacity(String),
    #[error("pool {0} element size leaves no data room")]
    NoDataRoom(String),
    #[error("pool {name} cache size {cache} exceeds limit {limit}")]
    CacheTooLarge {
        name: String,
        cache: usize,
        limit: usize,
    },
}

/// Port lifecycle failure, always naming the port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("port {port} is out of range (port count {count})")]
    InvalidPort { port: u16, count: u16 },
    #[error("cannot configure port {port}: {source}")]
    Configure { port: u16, source: DeviceError },
    #[error("cannot adjust descriptor counts of port {port}: {source}")]
    DescriptorAdjust { port: u16, source: DeviceError },
    #[error("cannot set up rx queue {queue} of port {port}: {source}")]
    RxQueueSetup {
        port: u16,
        queue: u16,
        source: DeviceError,
    },
    #[error("cannot set up tx queue {queue} of port {port}: {source}")]
    TxQueueSetup {
        port: u16,
        queue: u16,
        source: DeviceError,
    },
    #[error("cannot start port {port}: {source}")]
    Start { port: u16, source: DeviceError },
}

impl PortError {
    /// Port the failure refers to.
    pub fn port(&self) -> u16 {
        match self {
            PortError::InvalidPort { port, .. }
            | PortError::Configure { port, .. }
            | PortError::DescriptorAdjust { port, .. }
            | PortError::RxQueueSetup { port, .. }
            | PortError::TxQueueSetup { port, .. }
            | PortError::Start { port, .. } => *port,
        }
    }
}

/// Startup failure that terminates the whole process.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("Invalid EAL parameters: {0}")]
    Eal(String),
    #[error("Invalid port number: {0} (need an even count of at least 2)")]
    InvalidPortCount(u16),
    #[error("Fail to create mbuf pool: {0}")]
    PoolCreate(#[from] PoolError),
    #[error("Fail to init port {port}: {source}")]
    PortInit { port: u16, source: PortError },
    #[error("Fail to launch worker on lcore {lcore}: {source}")]
    Thread {
        lcore: usize,
        source: std::io::Error,
    },
}

impl FatalError {
    /// Process exit status, distinct per failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            FatalError::Eal(_) => 2,
            FatalError::InvalidPortCount(_) => 3,
            FatalError::PoolCreate(_) => 4,
            FatalError::PortInit { .. } => 5,
            FatalError::Thread { .. } => 1,
        }
    }
}

impl From<PortError> for FatalError {
    fn from(err: PortError) -> Self {
        FatalError::PortInit {
            port: err.port(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_init_message_names_the_port() {
        let err: FatalError = PortError::Start {
            port: 3,
            source: DeviceError::Driver { port: 3, code: -5 },
        }
        .into();
        assert!(err.to_string().starts_with("Fail to init port 3"));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            FatalError::Eal("x".into()).exit_code(),
            FatalError::InvalidPortCount(3).exit_code(),
            FatalError::PoolCreate(PoolError::ZeroCapacity("p".into())).exit_code(),
            FatalError::from(PortError::InvalidPort { port: 9, count: 2 }).exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
