//! Link-state checks.
//!
//! A down link is never fatal. It only means the port will produce empty receive bursts until the
//! peer comes up, so the pre-flight check logs it and forwarding starts on every port anyway. The
//! optional watcher keeps polling afterwards and logs transitions only.

use crate::device::{EthDevice, LinkStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Link state of one port at check time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortLink {
    pub port: u16,
    pub status: LinkStatus,
}

/// Result of a one-shot check over all ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub ports: Vec<PortLink>,
}

impl LinkReport {
    pub fn all_up(&self) -> bool {
        self.ports.iter().all(|p| p.status.up)
    }

    pub fn down_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter(|p| !p.status.up)
            .map(|p| p.port)
            .collect()
    }
}

pub struct LinkMonitor {
    device: Arc<dyn EthDevice>,
    ports: Vec<u16>,
}

impl LinkMonitor {
    pub fn new(device: Arc<dyn EthDevice>, ports: Vec<u16>) -> Self {
        Self { device, ports }
    }

    /// Link state of one port; a failed query reads as down.
    fn query(&self, port: u16) -> LinkStatus {
        match self.device.link_status(port) {
            Ok(status) => status,
            Err(err) => {
                warn!(port, error = %err, "link query failed");
                LinkStatus::DOWN
            }
        }
    }

    /// Query every port once and log the outcome.
    pub fn check_all(&self) -> LinkReport {
        let ports: Vec<PortLink> = self
            .ports
            .iter()
            .map(|&port| {
                let status = self.query(port);
                if status.up {
                    info!(port, speed_mbps = status.speed_mbps, "link is up");
                } else {
                    warn!(port, "link is down");
                }
                PortLink { port, status }
            })
            .collect();

        let report = LinkReport { ports };
        if !report.all_up() {
            warn!(down = ?report.down_ports(), "some ports are down, forwarding on all ports anyway");
        }
        report
    }

    /// Poll link state every `interval` until `cancel` is set, logging changes.
    ///
    /// Returns the number of transitions observed. A zero `interval` disables the watcher.
    pub async fn watch(self, interval: Duration, cancel: Arc<AtomicBool>) -> u64 {
        if interval.is_zero() {
            warn!("link watch interval is zero, watcher disabled");
            return 0;
        }
        let mut last: Vec<LinkStatus> = self.ports.iter().map(|&p| self.query(p)).collect();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut transitions = 0;

        while !cancel.load(Ordering::Acquire) {
            ticker.tick().await;
            if cancel.load(Ordering::Acquire) {
                break;
            }
            for (slot, &port) in last.iter_mut().zip(&self.ports) {
                let now = self.query(port);
                if now == *slot {
                    continue;
                }
                transitions += 1;
                match (slot.up, now.up) {
                    (false, true) => info!(port, speed_mbps = now.speed_mbps, "link came up"),
                    (true, false) => warn!(port, "link went down"),
                    _ => info!(
                        port,
                        from = slot.speed_mbps,
                        to = now.speed_mbps,
                        "link speed changed"
                    ),
                }
                *slot = now;
            }
        }
        transitions
    }
}
