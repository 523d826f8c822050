//! Forwarder orchestration.
//!
//! Startup is strictly ordered and all-or-nothing: validate the topology, create the buffer pool,
//! initialise every port, check links, then launch one worker per lcore that owns port pairs. Once
//! running, the main context only supervises: it waits for a termination request, joins the
//! workers, and only then takes the final statistics so the report reflects settled counters.

use crate::buffer_pool::MbufPool;
use crate::config::{ForwarderConfig, StatsFormat};
use crate::device::EthDevice;
use crate::eal::Eal;
use crate::error::FatalError;
use crate::link::{LinkMonitor, LinkReport};
use crate::port::PortManager;
use crate::shutdown::ShutdownController;
use crate::stats::{render_json, render_text, PortStats, StatsReporter};
use crate::worker::{assign_lcores, ForwardingWorker, LcoreAssignment, SweepStats, WorkerSummary};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Port pairing needs an even number of ports, at least two.
pub fn validate_port_count(count: u16) -> Result<(), FatalError> {
    if count < 2 || count % 2 != 0 {
        return Err(FatalError::InvalidPortCount(count));
    }
    Ok(())
}

/// Everything the supervisor observed during shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownOutcome {
    pub workers: Vec<WorkerSummary>,
    pub totals: SweepStats,
    /// Final counters, present when this call performed the final report.
    pub final_stats: Option<Vec<PortStats>>,
}

/// A running forwarder.
pub struct Forwarder {
    device: Arc<dyn EthDevice>,
    pool: MbufPool,
    config: ForwarderConfig,
    ports: Vec<u16>,
    link_report: LinkReport,
    assignments: Vec<LcoreAssignment>,
    workers: Vec<(usize, JoinHandle<WorkerSummary>)>,
    cancel: Arc<AtomicBool>,
}

impl Forwarder {
    /// Bring every port up and launch the workers.
    ///
    /// Workers receive the controller's cancellation flag at spawn time; nothing else is shared
    /// with them.
    pub fn start(
        eal: &Eal,
        device: Arc<dyn EthDevice>,
        config: ForwarderConfig,
        controller: &ShutdownController,
    ) -> Result<Forwarder, FatalError> {
        let port_count = device.port_count();
        validate_port_count(port_count)?;
        info!(ports = port_count, "number of ports");

        let pool = MbufPool::create(
            &config.pool.name,
            config.pool.capacity_for(port_count),
            config.pool.cache_size,
            config.pool.mbuf_size,
        )?;
        info!(
            pool = pool.name(),
            capacity = pool.capacity(),
            cache = pool.cache_size(),
            "buffer pool created"
        );

        PortManager::new(device.clone(), config.queues).init_all(&pool)?;

        let ports: Vec<u16> = (0..port_count).collect();
        let link_report = LinkMonitor::new(device.clone(), ports.clone()).check_all();

        let mut lcores = eal.worker_lcores();
        if lcores.is_empty() {
            warn!(
                lcore = eal.main_lcore(),
                "no worker lcores, forwarding on the main lcore"
            );
            lcores.push(eal.main_lcore());
        }
        let assignments = assign_lcores(&lcores, port_count);

        let cancel = controller.cancel_token();
        let mut workers = Vec::new();
        for assignment in &assignments {
            if assignment.is_idle() {
                info!(lcore = assignment.lcore, "lcore has no port pair, exiting");
                continue;
            }
            let worker = ForwardingWorker::new(
                assignment.clone(),
                device.clone(),
                cancel.clone(),
                config.effective_burst_size(),
                config.poll_policy,
            );
            match worker.spawn(config.worker_priority) {
                Ok(handle) => workers.push((assignment.lcore, handle)),
                Err(source) => {
                    cancel.store(true, Ordering::Release);
                    for (_, handle) in workers {
                        let _ = handle.join();
                    }
                    return Err(FatalError::Thread {
                        lcore: assignment.lcore,
                        source,
                    });
                }
            }
        }

        Ok(Forwarder {
            device,
            pool,
            config,
            ports,
            link_report,
            assignments,
            workers,
            cancel,
        })
    }

    pub fn pool(&self) -> &MbufPool {
        &self.pool
    }

    pub fn link_report(&self) -> &LinkReport {
        &self.link_report
    }

    pub fn assignments(&self) -> &[LcoreAssignment] {
        &self.assignments
    }

    pub fn reporter(&self) -> StatsReporter {
        StatsReporter::new(self.device.clone(), self.ports.clone())
    }

    /// Point-in-time counters; may be stale while workers run.
    pub fn stats(&self) -> Vec<PortStats> {
        self.reporter().report()
    }

    /// Supervise until termination is requested, then drain and write the final report to `out`.
    pub async fn run_until_shutdown<W: Write>(
        self,
        controller: &ShutdownController,
        out: &mut W,
    ) -> io::Result<ShutdownOutcome> {
        let mut background = Vec::new();
        if let Some(interval) = self.config.effective_link_poll_interval() {
            let monitor = LinkMonitor::new(self.device.clone(), self.ports.clone());
            let cancel = self.cancel.clone();
            background.push(tokio::spawn(async move {
                monitor.watch(interval, cancel).await;
            }));
        }
        if let Some(interval) = self.config.effective_stats_interval() {
            background.push(tokio::spawn(periodic_stats(
                self.reporter(),
                interval,
                self.config.stats_format,
                self.cancel.clone(),
            )));
        }

        controller.requested().await;
        info!(workers = self.workers.len(), "waiting for workers to stop");

        let mut summaries = Vec::with_capacity(self.workers.len());
        let mut totals = SweepStats::default();
        for (lcore, handle) in self.workers {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(summary)) => {
                    totals += summary.totals;
                    summaries.push(summary);
                }
                Ok(Err(_)) => error!(lcore, "worker panicked"),
                Err(err) => error!(lcore, error = %err, "cannot join worker"),
            }
        }
        for task in background {
            task.abort();
            let _ = task.await;
        }
        debug!(
            received = totals.received,
            transmitted = totals.transmitted,
            released = totals.released,
            pool_in_use = self.pool.in_use(),
            "workers drained"
        );

        let reporter = StatsReporter::new(self.device.clone(), self.ports.clone());
        let mut final_stats = None;
        controller.complete(|| final_stats = Some(reporter.report()));
        if let Some(stats) = final_stats.as_deref() {
            write_stats(out, stats, self.config.stats_format)?;
            out.flush()?;
        }

        Ok(ShutdownOutcome {
            workers: summaries,
            totals,
            final_stats,
        })
    }
}

fn write_stats<W: Write>(out: &mut W, stats: &[PortStats], format: StatsFormat) -> io::Result<()> {
    match format {
        StatsFormat::Text => render_text(out, stats),
        StatsFormat::Json => render_json(out, stats),
    }
}

async fn periodic_stats(
    reporter: StatsReporter,
    interval: Duration,
    format: StatsFormat,
    cancel: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if cancel.load(Ordering::Acquire) {
            break;
        }
        let stats = reporter.report();
        let mut stdout = io::stdout().lock();
        if let Err(err) = write_stats(&mut stdout, &stats, format) {
            warn!(error = %err, "cannot write periodic statistics");
        }
    }
}
