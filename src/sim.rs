//! Wire simulation for the software driver.
//!
//! The binary has no NIC to poll, so it cables a [`RingDevice`] to two kinds of helper threads: a
//! generator that pushes synthetic Ethernet frames into the even ports, and a sink that plays the
//! role of the NIC's transmit engine by draining every transmit ring and freeing the buffers.

use crate::device::{EthDevice, MacAddr};
use crate::ring_device::RingDevice;
use crate::worker::pair;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// Shortest frame on the wire, FCS excluded.
pub const MIN_FRAME_LEN: usize = 60;

/// IEEE local experimental EtherType.
const ETHERTYPE_EXPERIMENTAL: u16 = 0x88b5;

const GENERATOR_TICK: Duration = Duration::from_millis(1);
const SINK_IDLE: Duration = Duration::from_micros(100);

/// Build one test frame addressed from `src` to `dst` carrying `seq`.
pub fn build_frame(dst: MacAddr, src: MacAddr, seq: u64, len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; len.max(MIN_FRAME_LEN)];
    frame[0..6].copy_from_slice(&dst.0);
    frame[6..12].copy_from_slice(&src.0);
    frame[12..14].copy_from_slice(&ETHERTYPE_EXPERIMENTAL.to_be_bytes());
    frame[14..22].copy_from_slice(&seq.to_be_bytes());
    frame
}

/// Sequence number written by [`build_frame`], if the frame carries one.
pub fn frame_seq(frame: &[u8]) -> Option<u64> {
    if frame.len() < 22 || frame[12..14] != ETHERTYPE_EXPERIMENTAL.to_be_bytes() {
        return None;
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&frame[14..22]);
    Some(u64::from_be_bytes(seq))
}

/// Generator and sink threads attached to a [`RingDevice`].
pub struct SimWire {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<u64>>,
}

impl SimWire {
    /// Start the sink and, when `rate` is non-zero, a generator injecting `rate` frames per
    /// millisecond into every even port.
    pub fn start(device: Arc<RingDevice>, rate: u64, frame_len: usize) -> io::Result<SimWire> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(2);

        let sink_device = device.clone();
        let sink_stop = stop.clone();
        threads.push(
            std::thread::Builder::new()
                .name("sim-sink".into())
                .spawn(move || run_sink(&sink_device, &sink_stop))?,
        );

        if rate > 0 {
            let gen_stop = stop.clone();
            let spawned = std::thread::Builder::new()
                .name("sim-generator".into())
                .spawn(move || run_generator(&device, &gen_stop, rate, frame_len));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    stop.store(true, Ordering::Release);
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }
        info!(rate, frame_len, "simulated wire attached");
        Ok(SimWire { stop, threads })
    }

    /// Stop the helper threads and return how many frames they moved in total.
    pub fn stop(self) -> u64 {
        self.stop.store(true, Ordering::Release);
        self.threads
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .sum()
    }
}

fn run_generator(device: &RingDevice, stop: &AtomicBool, rate: u64, frame_len: usize) -> u64 {
    let ports: Vec<u16> = (0..device.port_count()).step_by(2).collect();
    let mut seq = 0u64;
    let mut injected = 0u64;
    while !stop.load(Ordering::Acquire) {
        for &port in &ports {
            let (Ok(src), Ok(dst)) = (device.mac_address(port), device.mac_address(pair(port)))
            else {
                continue;
            };
            for _ in 0..rate {
                if device.inject(port, &build_frame(dst, src, seq, frame_len)) {
                    injected += 1;
                }
                seq += 1;
            }
        }
        std::thread::sleep(GENERATOR_TICK);
    }
    debug!(injected, "generator stopped");
    injected
}

fn run_sink(device: &RingDevice, stop: &AtomicBool) -> u64 {
    let mut drained = 0u64;
    while !stop.load(Ordering::Acquire) {
        let mut moved = 0;
        for port in 0..device.port_count() {
            moved += device.drain_tx(port).len();
        }
        drained += moved as u64;
        if moved == 0 {
            std::thread::sleep(SINK_IDLE);
        }
    }
    debug!(drained, "sink stopped");
    drained
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_frames_are_padded() {
        let frame = build_frame(MacAddr([2, 0, 0, 0, 0, 1]), MacAddr([2, 0, 0, 0, 0, 0]), 7, 10);
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        assert_eq!(&frame[0..6], &[2, 0, 0, 0, 0, 1]);
        assert_eq!(frame_seq(&frame), Some(7));
    }

    #[test]
    fn foreign_frames_have_no_sequence() {
        assert_eq!(frame_seq(&[0u8; 64]), None);
        assert_eq!(frame_seq(&[0u8; 4]), None);
    }
}
