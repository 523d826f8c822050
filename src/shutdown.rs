//! Coordinated shutdown.
//!
//! `Running -> Draining -> Stopped`. The first termination request moves the controller to
//! `Draining` and sets the shared cancellation flag that every worker polls; later requests are
//! no-ops. Statistics are not printed from the signal handler: the supervisor waits for the
//! workers to stop and then calls [`ShutdownController::complete`], which runs the final report
//! exactly once.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownState::Running,
            1 => ShutdownState::Draining,
            _ => ShutdownState::Stopped,
        }
    }
}

pub struct ShutdownController {
    state: AtomicU8,
    cancel: Arc<AtomicBool>,
    notify: Notify,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running as u8),
            cancel: Arc::new(AtomicBool::new(false)),
            notify: Notify::new(),
        }
    }

    /// Request termination. Returns `true` only for the request that caused the transition.
    pub fn request(&self) -> bool {
        let first = self
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if first {
            self.cancel.store(true, Ordering::Release);
            self.notify.notify_one();
        }
        first
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Flag handed to every worker at spawn time.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Resolve once termination has been requested.
    pub async fn requested(&self) {
        while self.state() == ShutdownState::Running {
            self.notify.notified().await;
        }
    }

    /// Move from `Draining` to `Stopped`, running `report` on that transition only.
    ///
    /// Returns `false` (and skips `report`) if no request is pending or the controller already
    /// stopped.
    pub fn complete<F: FnOnce()>(&self, report: F) -> bool {
        let won = self
            .state
            .compare_exchange(
                ShutdownState::Draining as u8,
                ShutdownState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            report();
        }
        won
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Route SIGINT and SIGTERM to `controller`.
///
/// The handler only flips state; it never reports or touches ports.
pub fn install_signal_handler(controller: Arc<ShutdownController>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if controller.request() {
            info!("termination requested, draining workers");
        } else {
            debug!("repeated termination request ignored");
        }
    })
}
