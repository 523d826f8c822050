//! pollfwd: poll-mode forwarder between paired ports.
//!
//! Runtime arguments come first (`-l 0-3 --main-lcore 0 -n 4`), optionally closed by `--`; the
//! rest are application options. Without a NIC driver the binary forwards over the in-memory ring
//! driver, fed by a synthetic traffic generator.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pollfwd::config::{
    ForwarderConfig, PollPolicy, StatsFormat, BURST_SIZE, MBUF_CACHE_SIZE, NUM_MBUFS_PER_PORT,
    RX_RING_SIZE, TX_RING_SIZE,
};
use pollfwd::device::DescLimits;
use pollfwd::eal::Eal;
use pollfwd::error::FatalError;
use pollfwd::forwarder::Forwarder;
use pollfwd::ring_device::RingDevice;
use pollfwd::shutdown::{install_signal_handler, ShutdownController};
use pollfwd::sim::{SimWire, MIN_FRAME_LEN};
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl From<OutputFormat> for StatsFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => StatsFormat::Text,
            OutputFormat::Json => StatsFormat::Json,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "pollfwd",
    about = "Poll-mode forwarder moving every frame received on a port to its paired port",
    version
)]
struct Cli {
    /// Frames requested per receive call.
    #[arg(long, default_value_t = BURST_SIZE)]
    burst_size: usize,

    /// Receive descriptors per port.
    #[arg(long, default_value_t = RX_RING_SIZE)]
    rx_desc: u16,

    /// Transmit descriptors per port.
    #[arg(long, default_value_t = TX_RING_SIZE)]
    tx_desc: u16,

    /// Pool buffers reserved per port.
    #[arg(long, default_value_t = NUM_MBUFS_PER_PORT)]
    mbufs_per_port: usize,

    #[arg(long, default_value_t = MBUF_CACHE_SIZE)]
    mbuf_cache: usize,

    /// Sleep up to this many microseconds after an idle sweep instead of busy polling.
    #[arg(long)]
    backoff_us: Option<u64>,

    /// Worker scheduling priority (0 keeps the default policy, 1..=3 request real-time).
    #[arg(long, default_value_t = 0)]
    worker_priority: i32,

    /// Link watch interval in milliseconds; 0 disables the watcher.
    #[arg(long, default_value_t = 1000)]
    link_poll_ms: u64,

    /// Print statistics every N seconds as well as at exit.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    stats_interval: Option<u64>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    stats_format: OutputFormat,

    /// Number of simulated ports.
    #[arg(long, default_value_t = 2)]
    sim_ports: u16,

    /// Frames injected per millisecond into each even simulated port.
    #[arg(long, default_value_t = 0)]
    sim_rate: u64,

    #[arg(long, default_value_t = MIN_FRAME_LEN)]
    sim_frame_len: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn forwarder_config(&self) -> ForwarderConfig {
        let mut config = ForwarderConfig::default();
        config.queues.rx_desc = self.rx_desc;
        config.queues.tx_desc = self.tx_desc;
        config.pool.mbufs_per_port = self.mbufs_per_port;
        config.pool.cache_size = self.mbuf_cache;
        config.burst_size = self.burst_size;
        config.poll_policy = match self.backoff_us {
            Some(us) => PollPolicy::Backoff {
                max: Duration::from_micros(us),
            },
            None => PollPolicy::BusyPoll,
        };
        config.worker_priority = self.worker_priority;
        config.link_poll_interval =
            (self.link_poll_ms > 0).then(|| Duration::from_millis(self.link_poll_ms));
        config.stats_interval = self.stats_interval.map(Duration::from_secs);
        config.stats_format = self.stats_format.into();
        config
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let (eal, consumed) = match Eal::init(&args) {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(err.exit_code());
        }
    };
    let program = args.first().cloned().unwrap_or_else(|| "pollfwd".to_string());
    let cli = Cli::parse_from(std::iter::once(program).chain(args.into_iter().skip(consumed)));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    match run(eal, &cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<FatalError>() {
            Some(fatal) => {
                error!(error = %fatal, "startup failed");
                eprintln!("{fatal}");
                ExitCode::from(fatal.exit_code())
            }
            None => {
                error!(error = %format!("{err:#}"), "forwarder failed");
                ExitCode::FAILURE
            }
        },
    }
}

fn run(eal: Eal, cli: &Cli) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        lcores = ?eal.lcores(),
        main_lcore = eal.main_lcore(),
        "starting pollfwd"
    );

    let device = Arc::new(RingDevice::new(cli.sim_ports, DescLimits::default()));
    let controller = Arc::new(ShutdownController::new());
    install_signal_handler(controller.clone()).context("installing signal handler")?;

    let forwarder = Forwarder::start(&eal, device.clone(), cli.forwarder_config(), &controller)?;
    let wire = SimWire::start(device, cli.sim_rate, cli.sim_frame_len)
        .context("starting simulated wire")?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building supervisor runtime")?;
    let mut stdout = io::stdout();
    let outcome = rt
        .block_on(forwarder.run_until_shutdown(&controller, &mut stdout))
        .context("writing final statistics")?;

    let moved = wire.stop();
    info!(
        workers = outcome.workers.len(),
        received = outcome.totals.received,
        transmitted = outcome.totals.transmitted,
        released = outcome.totals.released,
        wire_frames = moved,
        "forwarder stopped"
    );
    Ok(())
}
