// End-to-end forwarding tests over the in-memory ring driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pollfwd::buffer_pool::{MbufPool, DEFAULT_MBUF_SIZE};
use pollfwd::config::{ForwarderConfig, PollPolicy, QueueConfig, StatsFormat};
use pollfwd::device::{DescLimits, EthDevice};
use pollfwd::eal::Eal;
use pollfwd::error::FatalError;
use pollfwd::forwarder::{validate_port_count, Forwarder};
use pollfwd::port::PortManager;
use pollfwd::ring_device::RingDevice;
use pollfwd::shutdown::{ShutdownController, ShutdownState};
use pollfwd::sim::{build_frame, frame_seq};
use pollfwd::stats::StatsReporter;
use pollfwd::worker::{pair, ForwardingWorker, LcoreAssignment};

fn bring_up(ports: u16, pool_size: usize) -> (Arc<RingDevice>, MbufPool) {
    let device = Arc::new(RingDevice::new(ports, DescLimits::default()));
    let pool = MbufPool::create("MBUF_POOL", pool_size, 0, DEFAULT_MBUF_SIZE).unwrap();
    PortManager::new(device.clone(), QueueConfig::default())
        .init_all(&pool)
        .unwrap();
    (device, pool)
}

fn worker_for(device: &Arc<RingDevice>, ports: Vec<u16>, cancel: Arc<AtomicBool>) -> ForwardingWorker {
    ForwardingWorker::new(
        LcoreAssignment { lcore: 1, ports },
        device.clone(),
        cancel,
        32,
        PollPolicy::BusyPoll,
    )
}

fn inject_sequence(device: &RingDevice, port: u16, count: u64) {
    let src = device.mac_address(port).unwrap();
    let dst = device.mac_address(pair(port)).unwrap();
    for seq in 0..count {
        assert!(device.inject(port, &build_frame(dst, src, seq, 64)));
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    done()
}

#[test]
fn frames_cross_to_the_paired_port_in_order() {
    let (device, pool) = bring_up(2, 100);
    inject_sequence(&device, 0, 10);

    let mut worker = worker_for(&device, vec![0, 1], Arc::new(AtomicBool::new(false)));
    let sweep = worker.poll_once();
    assert_eq!(sweep.received, 10);
    assert_eq!(sweep.transmitted, 10);
    assert_eq!(sweep.released, 0);

    let sent = device.drain_tx(1);
    let seqs: Vec<u64> = sent.iter().filter_map(|m| frame_seq(m.data())).collect();
    assert_eq!(seqs, (0..10).collect::<Vec<u64>>());
    assert!(device.drain_tx(0).is_empty());

    let stats = StatsReporter::new(device.clone(), vec![0, 1]).report();
    assert_eq!(stats[0].received, 10);
    assert_eq!(stats[1].transmitted, 10);
    assert_eq!(stats[0].transmitted, 0);

    drop(sent);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn unsent_tail_is_released_one_buffer_at_a_time() {
    let (device, pool) = bring_up(2, 100);
    device.set_tx_budget(1, Some(7));
    inject_sequence(&device, 0, 10);

    let mut worker = worker_for(&device, vec![0, 1], Arc::new(AtomicBool::new(false)));
    let sweep = worker.poll_once();
    assert_eq!(sweep.received, 10);
    assert_eq!(sweep.transmitted, 7);
    assert_eq!(sweep.released, 3);
    assert_eq!(device.release_calls(), 3);
    assert_eq!(sweep.received, sweep.transmitted + sweep.released);
    assert_eq!(device.stats(1).unwrap().opackets, 7);

    let sent = device.drain_tx(1);
    let seqs: Vec<u64> = sent.iter().filter_map(|m| frame_seq(m.data())).collect();
    assert_eq!(seqs, (0..7).collect::<Vec<u64>>());
    assert_eq!(pool.in_use(), 7);
    drop(sent);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn full_transmit_ring_drops_instead_of_blocking() {
    let device = Arc::new(RingDevice::new(2, DescLimits::default()));
    let pool = MbufPool::create("MBUF_POOL", 256, 0, DEFAULT_MBUF_SIZE).unwrap();
    let queues = QueueConfig {
        tx_desc: 32,
        ..QueueConfig::default()
    };
    PortManager::new(device.clone(), queues)
        .init_all(&pool)
        .unwrap();

    inject_sequence(&device, 0, 100);
    let mut worker = worker_for(&device, vec![0, 1], Arc::new(AtomicBool::new(false)));
    let mut totals = worker.poll_once();
    for _ in 0..3 {
        totals += worker.poll_once();
    }
    assert_eq!(totals.received, 100);
    assert_eq!(totals.transmitted, 32);
    assert_eq!(totals.released, 68);
    assert_eq!(device.tx_pending(1), 32);
}

#[test]
fn receive_error_is_counted_and_the_sweep_continues() {
    let (device, _pool) = bring_up(2, 100);
    inject_sequence(&device, 0, 4);
    inject_sequence(&device, 1, 4);
    device.fail_next_rx(0);

    let mut worker = worker_for(&device, vec![0, 1], Arc::new(AtomicBool::new(false)));
    let sweep = worker.poll_once();
    assert_eq!(sweep.errors, 1);
    assert_eq!(sweep.received, 4);
    assert_eq!(device.tx_pending(0), 4);

    let sweep = worker.poll_once();
    assert_eq!(sweep.errors, 0);
    assert_eq!(device.tx_pending(1), 4);
}

#[test]
fn transmit_error_releases_the_whole_burst() {
    let (device, pool) = bring_up(2, 100);
    inject_sequence(&device, 0, 5);
    inject_sequence(&device, 1, 2);
    device.fail_next_tx(1);

    let mut worker = worker_for(&device, vec![0, 1], Arc::new(AtomicBool::new(false)));
    let sweep = worker.poll_once();
    assert_eq!(sweep.errors, 1);
    assert_eq!(sweep.received, 7);
    assert_eq!(sweep.transmitted, 2);
    assert_eq!(sweep.released, 5);
    assert_eq!(device.release_calls(), 5);
    assert_eq!(device.stats(1).unwrap().opackets, 0);
    assert_eq!(device.tx_pending(1), 0);

    // The failure on port 0's pair did not stop the sweep from serving port 1.
    assert_eq!(device.stats(0).unwrap().opackets, 2);
    drop(device.drain_tx(0));
    assert_eq!(pool.in_use(), 0);

    inject_sequence(&device, 0, 3);
    let sweep = worker.poll_once();
    assert_eq!(sweep.errors, 0);
    assert_eq!(device.stats(1).unwrap().opackets, 3);
}

#[test]
fn port_count_must_be_even_and_non_zero() {
    for count in [0u16, 1, 3, 5] {
        let err = validate_port_count(count).unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(matches!(err, FatalError::InvalidPortCount(n) if n == count));
    }
    for count in [2u16, 4, 6] {
        validate_port_count(count).unwrap();
    }
}

#[test]
fn forwarder_refuses_odd_topology_before_touching_ports() {
    let device = Arc::new(RingDevice::new(3, DescLimits::default()));
    let eal = Eal::with_lcores(vec![0, 1], 0).unwrap();
    let controller = ShutdownController::new();
    let result = Forwarder::start(&eal, device.clone(), ForwarderConfig::default(), &controller);
    assert!(matches!(result, Err(FatalError::InvalidPortCount(3))));
    assert!(!device.is_started(0));
}

#[test]
fn cancelled_worker_stops_polling() {
    let (device, _pool) = bring_up(2, 100);
    let cancel = Arc::new(AtomicBool::new(false));
    let handle = worker_for(&device, vec![0, 1], cancel.clone())
        .spawn(0)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || device.rx_calls() > 100));
    cancel.store(true, Ordering::Release);

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        let _ = done_tx.send(handle.join());
    });
    let summary = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("worker did not stop")
        .unwrap();
    assert!(summary.sweeps > 0);

    let rx_after = device.rx_calls();
    let tx_after = device.tx_calls();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(device.rx_calls(), rx_after);
    assert_eq!(device.tx_calls(), tx_after);
}

#[test]
fn counters_never_decrease_while_forwarding() {
    let (device, pool) = bring_up(2, 512);
    let cancel = Arc::new(AtomicBool::new(false));
    let handle = worker_for(&device, vec![0, 1], cancel.clone())
        .spawn(0)
        .unwrap();
    let reporter = StatsReporter::new(device.clone(), vec![0, 1]);

    let src = device.mac_address(0).unwrap();
    let dst = device.mac_address(1).unwrap();
    let mut last = reporter.report();
    for seq in 0..2_000u64 {
        device.inject(0, &build_frame(dst, src, seq, 64));
        if seq % 64 == 0 {
            drop(device.drain_tx(1));
            let now = reporter.report();
            for (before, after) in last.iter().zip(&now) {
                assert!(after.received >= before.received);
                assert!(after.transmitted >= before.transmitted);
                assert!(after.dropped >= before.dropped);
            }
            last = now;
        }
    }

    cancel.store(true, Ordering::Release);
    let summary = handle.join().unwrap();
    assert_eq!(
        summary.totals.received,
        summary.totals.transmitted + summary.totals.released
    );
    drop(device.drain_tx(1));
    drop(device.drain_tx(0));
    // Frames injected after the worker stopped are still parked in the receive ring.
    assert_eq!(pool.in_use(), device.rx_pending(0));
}

fn small_config() -> ForwarderConfig {
    let mut config = ForwarderConfig::default();
    config.pool.mbufs_per_port = 64;
    config.pool.cache_size = 16;
    config.poll_policy = PollPolicy::Backoff {
        max: Duration::from_micros(50),
    };
    config.link_poll_interval = Some(Duration::from_millis(10));
    config
}

#[tokio::test]
async fn forwarder_reports_once_after_workers_stop() {
    let device = Arc::new(RingDevice::new(2, DescLimits::default()));
    let eal = Eal::with_lcores(vec![0, 1], 0).unwrap();
    let controller = ShutdownController::new();
    let forwarder = Forwarder::start(&eal, device.clone(), small_config(), &controller).unwrap();
    assert_eq!(forwarder.pool().capacity(), 128);
    assert!(forwarder.link_report().all_up());
    assert_eq!(forwarder.assignments().len(), 1);

    inject_sequence(&device, 0, 20);
    assert!(wait_until(Duration::from_secs(5), || device.tx_pending(1) == 20));

    assert!(controller.request());
    let mut out = Vec::new();
    let outcome = forwarder
        .run_until_shutdown(&controller, &mut out)
        .await
        .unwrap();

    assert_eq!(controller.state(), ShutdownState::Stopped);
    assert!(!controller.complete(|| panic!("reported twice")));

    let stats = outcome.final_stats.expect("final report missing");
    assert_eq!(stats[0].received, 20);
    assert_eq!(stats[1].transmitted, 20);
    assert_eq!(outcome.totals.received, 20);

    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("Stats for port 0\nRx:        20 Tx:         0 Dropped:         0\n"));
    assert!(text.contains("Stats for port 1\n"));
}

#[tokio::test]
async fn json_report_has_one_line_per_port() {
    let device = Arc::new(RingDevice::new(4, DescLimits::default()));
    let eal = Eal::with_lcores(vec![0, 1, 2], 0).unwrap();
    let controller = ShutdownController::new();
    let mut config = small_config();
    config.stats_format = StatsFormat::Json;
    let forwarder = Forwarder::start(&eal, device, config, &controller).unwrap();
    assert_eq!(forwarder.assignments()[0].ports, vec![0, 1]);
    assert_eq!(forwarder.assignments()[1].ports, vec![2, 3]);

    controller.request();
    let mut out = Vec::new();
    let outcome = forwarder
        .run_until_shutdown(&controller, &mut out)
        .await
        .unwrap();
    assert_eq!(outcome.workers.len(), 2);

    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["port"], 0);
    assert_eq!(first["received"], 0);
}

#[tokio::test]
async fn zero_intervals_leave_periodic_tasks_off() {
    let device = Arc::new(RingDevice::new(2, DescLimits::default()));
    let eal = Eal::with_lcores(vec![0, 1], 0).unwrap();
    let controller = ShutdownController::new();
    let mut config = small_config();
    config.stats_interval = Some(Duration::ZERO);
    config.link_poll_interval = Some(Duration::ZERO);
    let forwarder = Forwarder::start(&eal, device.clone(), config, &controller).unwrap();

    inject_sequence(&device, 0, 4);
    assert!(wait_until(Duration::from_secs(5), || device.tx_pending(1) == 4));

    controller.request();
    let mut out = Vec::new();
    let outcome = forwarder
        .run_until_shutdown(&controller, &mut out)
        .await
        .unwrap();
    let stats = outcome.final_stats.expect("final report missing");
    assert_eq!(stats[1].transmitted, 4);
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.matches("Stats for port 0").count(), 1);
}
