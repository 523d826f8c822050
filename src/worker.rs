//! Forwarding worker: the receive/transmit hot loop.
//!
//! Each worker owns a disjoint set of ports and sweeps them round-robin. For every port it pulls a
//! burst from the receive queue, offers the whole burst in receive order to the transmit queue of
//! the paired port, and hands every buffer the transmit ring did not accept back to the pool.
//! Nothing in the loop blocks, allocates or takes a lock; an empty burst just moves on to the next
//! port.
//!
//! Ports are paired `0 <-> 1`, `2 <-> 3` and so on. The pairing assumes adjacent ports are cabled
//! to the same traffic source and sink; the forwarder cannot verify that.

use crate::buffer_pool::Mbuf;
use crate::config::PollPolicy;
use crate::device::EthDevice;
use crate::threading::{set_thread_core, set_thread_priority};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// First sleep after an idle sweep under [`PollPolicy::Backoff`].
const MIN_IDLE_SLEEP: Duration = Duration::from_micros(1);

/// Port whose transmit queue receives the frames read from `port`.
#[inline]
pub const fn pair(port: u16) -> u16 {
    port ^ 1
}

/// Ports owned by one execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcoreAssignment {
    pub lcore: usize,
    pub ports: Vec<u16>,
}

impl LcoreAssignment {
    pub fn is_idle(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Spread port pairs round-robin over `worker_lcores`.
///
/// Both ports of a pair always land on the same lcore, and no port is given to two lcores. Lcores
/// left without a pair are returned with an empty port list.
pub fn assign_lcores(worker_lcores: &[usize], port_count: u16) -> Vec<LcoreAssignment> {
    let mut assignments: Vec<LcoreAssignment> = worker_lcores
        .iter()
        .map(|&lcore| LcoreAssignment {
            lcore,
            ports: Vec::new(),
        })
        .collect();
    if assignments.is_empty() {
        return assignments;
    }

    let slots = assignments.len();
    for (index, first) in (0..port_count).step_by(2).enumerate() {
        let owner = &mut assignments[index % slots];
        owner.ports.push(first);
        if pair(first) < port_count {
            owner.ports.push(pair(first));
        }
    }
    assignments
}

/// Counters for one or more sweeps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Buffers returned by receive calls.
    pub received: u64,
    /// Buffers accepted by transmit calls.
    pub transmitted: u64,
    /// Unsent buffers handed back to the pool.
    pub released: u64,
    /// Receive or transmit calls that returned an error.
    pub errors: u64,
}

impl SweepStats {
    pub fn is_idle(&self) -> bool {
        self.received == 0
    }
}

impl AddAssign for SweepStats {
    fn add_assign(&mut self, rhs: Self) {
        self.received += rhs.received;
        self.transmitted += rhs.transmitted;
        self.released += rhs.released;
        self.errors += rhs.errors;
    }
}

/// What a worker did before it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub lcore: usize,
    pub ports: Vec<u16>,
    pub sweeps: u64,
    pub totals: SweepStats,
}

/// Next idle sleep: start at 1 µs and double up to `max`.
fn next_idle_sleep(current: Duration, max: Duration) -> Duration {
    if current.is_zero() {
        MIN_IDLE_SLEEP.min(max)
    } else {
        current.saturating_mul(2).min(max)
    }
}

pub struct ForwardingWorker {
    lcore: usize,
    ports: Vec<u16>,
    device: Arc<dyn EthDevice>,
    cancel: Arc<AtomicBool>,
    burst_size: usize,
    policy: PollPolicy,
    /// Reused burst storage; empty between ports.
    burst: Vec<Mbuf>,
}

impl ForwardingWorker {
    pub fn new(
        assignment: LcoreAssignment,
        device: Arc<dyn EthDevice>,
        cancel: Arc<AtomicBool>,
        burst_size: usize,
        policy: PollPolicy,
    ) -> Self {
        let burst_size = burst_size.max(1);
        Self {
            lcore: assignment.lcore,
            ports: assignment.ports,
            device,
            cancel,
            burst_size,
            policy,
            burst: Vec::with_capacity(burst_size),
        }
    }

    pub fn lcore(&self) -> usize {
        self.lcore
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// One sweep over the owned ports.
    ///
    /// Cancellation is checked before each port, so a sweep stops at a port boundary and never
    /// abandons a burst that was already received.
    pub fn poll_once(&mut self) -> SweepStats {
        let mut sweep = SweepStats::default();
        for index in 0..self.ports.len() {
            if self.cancel.load(Ordering::Acquire) {
                break;
            }
            let port = self.ports[index];
            self.forward_port(port, &mut sweep);
        }
        sweep
    }

    fn forward_port(&mut self, port: u16, sweep: &mut SweepStats) {
        let received = match self
            .device
            .rx_burst(port, 0, &mut self.burst, self.burst_size)
        {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => {
                sweep.errors += 1;
                // A failing driver must not leave buffers behind in the burst.
                for mbuf in self.burst.drain(..) {
                    self.device.release(mbuf);
                }
                return;
            }
        };

        let transmitted = match self.device.tx_burst(pair(port), 0, &mut self.burst) {
            Ok(n) => n,
            Err(_) => {
                sweep.errors += 1;
                0
            }
        };

        let released = self.burst.len();
        for mbuf in self.burst.drain(..) {
            self.device.release(mbuf);
        }

        sweep.received += received as u64;
        sweep.transmitted += transmitted as u64;
        sweep.released += released as u64;
    }

    /// Sweep until cancelled.
    pub fn run(mut self) -> WorkerSummary {
        let mut summary = WorkerSummary {
            lcore: self.lcore,
            ports: self.ports.clone(),
            sweeps: 0,
            totals: SweepStats::default(),
        };
        if self.ports.is_empty() {
            debug!(lcore = self.lcore, "no ports assigned, exiting");
            return summary;
        }
        info!(lcore = self.lcore, ports = ?self.ports, "forwarding worker started");

        let mut idle_sleep = Duration::ZERO;
        while !self.cancel.load(Ordering::Acquire) {
            let sweep = self.poll_once();
            summary.sweeps += 1;
            summary.totals += sweep;

            match self.policy {
                PollPolicy::BusyPoll => {
                    if sweep.is_idle() {
                        std::hint::spin_loop();
                    }
                }
                PollPolicy::Backoff { max } => {
                    if sweep.is_idle() {
                        idle_sleep = next_idle_sleep(idle_sleep, max);
                        std::thread::sleep(idle_sleep);
                    } else {
                        idle_sleep = Duration::ZERO;
                    }
                }
            }
        }

        info!(
            lcore = self.lcore,
            sweeps = summary.sweeps,
            received = summary.totals.received,
            transmitted = summary.totals.transmitted,
            released = summary.totals.released,
            "forwarding worker stopped"
        );
        summary
    }

    /// Run the worker on a dedicated thread pinned to its lcore.
    pub fn spawn(self, priority: i32) -> std::io::Result<JoinHandle<WorkerSummary>> {
        let lcore = self.lcore;
        std::thread::Builder::new()
            .name(format!("fwd-lcore-{lcore}"))
            .spawn(move || {
                set_thread_core(lcore);
                if priority > 0 {
                    set_thread_priority(priority);
                }
                self.run()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_is_an_involution_without_fixed_points() {
        for port in 0..=u16::MAX {
            assert_eq!(pair(pair(port)), port);
            assert_ne!(pair(port), port);
        }
        assert_eq!(pair(0), 1);
        assert_eq!(pair(3), 2);
    }

    #[test]
    fn pairs_spread_round_robin_over_lcores() {
        let assignments = assign_lcores(&[1, 2], 6);
        assert_eq!(
            assignments,
            vec![
                LcoreAssignment {
                    lcore: 1,
                    ports: vec![0, 1, 4, 5]
                },
                LcoreAssignment {
                    lcore: 2,
                    ports: vec![2, 3]
                },
            ]
        );
    }

    #[test]
    fn surplus_lcores_stay_idle() {
        let assignments = assign_lcores(&[1, 2, 3], 2);
        assert_eq!(assignments[0].ports, vec![0, 1]);
        assert!(assignments[1].is_idle());
        assert!(assignments[2].is_idle());
    }

    #[test]
    fn every_port_has_exactly_one_owner() {
        let assignments = assign_lcores(&[4, 5, 6], 10);
        let mut owned: Vec<u16> = assignments.iter().flat_map(|a| a.ports.clone()).collect();
        owned.sort_unstable();
        assert_eq!(owned, (0..10).collect::<Vec<u16>>());
        for a in &assignments {
            for &p in &a.ports {
                assert!(a.ports.contains(&pair(p)));
            }
        }
    }

    #[test]
    fn idle_sleep_doubles_up_to_max() {
        let max = Duration::from_micros(5);
        let mut sleep = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..5 {
            sleep = next_idle_sleep(sleep, max);
            seen.push(sleep.as_micros());
        }
        assert_eq!(seen, vec![1, 2, 4, 5, 5]);
    }
}
