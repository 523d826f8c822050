//! Per-port statistics reporting.
//!
//! Counters come straight from the driver, so a report taken while workers are running is a
//! point-in-time snapshot that may already be stale when printed. The final report is taken only
//! after every worker has stopped.

use crate::device::EthDevice;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::warn;

/// Counters for one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortStats {
    pub port: u16,
    pub received: u64,
    pub transmitted: u64,
    pub dropped: u64,
}

pub struct StatsReporter {
    device: Arc<dyn EthDevice>,
    ports: Vec<u16>,
}

impl StatsReporter {
    pub fn new(device: Arc<dyn EthDevice>, ports: Vec<u16>) -> Self {
        Self { device, ports }
    }

    /// Read the counters of every configured port.
    ///
    /// A port whose counters cannot be read is reported as all zeros.
    pub fn report(&self) -> Vec<PortStats> {
        self.ports
            .iter()
            .map(|&port| match self.device.stats(port) {
                Ok(stats) => PortStats {
                    port,
                    received: stats.ipackets,
                    transmitted: stats.opackets,
                    dropped: stats.imissed,
                },
                Err(err) => {
                    warn!(port, error = %err, "cannot read port counters");
                    PortStats {
                        port,
                        ..PortStats::default()
                    }
                }
            })
            .collect()
    }
}

/// Write the classic two-line-per-port block.
pub fn render_text<W: Write>(out: &mut W, stats: &[PortStats]) -> io::Result<()> {
    for s in stats {
        writeln!(out, "Stats for port {}", s.port)?;
        writeln!(
            out,
            "Rx: {:>9} Tx: {:>9} Dropped: {:>9}",
            s.received, s.transmitted, s.dropped
        )?;
    }
    Ok(())
}

/// Write one JSON object per port, one per line.
pub fn render_json<W: Write>(out: &mut W, stats: &[PortStats]) -> io::Result<()> {
    for s in stats {
        serde_json::to_writer(&mut *out, s)?;
        writeln!(out)?;
    }
    Ok(())
}
