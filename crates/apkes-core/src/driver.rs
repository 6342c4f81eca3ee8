//! Tokio event-loop driver.
//!
//! The core is a synchronous state machine; this driver funnels received
//! frames and timer deadlines into it from a single task, which is the
//! only concurrency discipline the subsystem needs. Construct the
//! [`crate::Apkes`] with a [`TokioClock`] so virtual time in tests moves
//! the core clock together with the driver's sleeps.
//!
//! The bootstrap callback is not `Send`, so the returned future must run
//! on a current-thread runtime or a `LocalSet`.

use crate::apkes::Apkes;
use crate::mac::WireFrame;
use crate::timer::Clock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

/// Tokio-backed [`Clock`], starting at zero on construction.
///
/// Respects tokio's paused/auto-advancing test time.
pub struct TokioClock {
    start: Instant,
}

impl TokioClock {
    /// A clock starting now
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Runs one [`Apkes`] instance on one tokio task
pub struct Driver {
    apkes: Apkes,
    rx: mpsc::UnboundedReceiver<WireFrame>,
    epoch: Instant,
}

impl Driver {
    /// Wrap a subsystem; the returned sender injects received frames.
    ///
    /// The `Apkes` must have been constructed just before this call so
    /// its clock zero does not precede the driver's epoch by more than
    /// scheduling noise.
    #[must_use]
    pub fn new(apkes: Apkes) -> (Self, mpsc::UnboundedSender<WireFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                apkes,
                rx,
                epoch: Instant::now(),
            },
            tx,
        )
    }

    /// Access the wrapped subsystem, e.g. to call
    /// [`Apkes::bootstrap`] before running
    pub fn apkes_mut(&mut self) -> &mut Apkes {
        &mut self.apkes
    }

    /// Read access to the wrapped subsystem
    #[must_use]
    pub fn apkes(&self) -> &Apkes {
        &self.apkes
    }

    /// Serve frames and timers until every frame sender is dropped,
    /// then hand the subsystem back.
    pub async fn run(mut self) -> Apkes {
        const IDLE: Duration = Duration::from_secs(3600);
        loop {
            self.apkes.poll_timers();
            let deadline = match self.apkes.next_deadline() {
                Some(d) => self.epoch + d,
                None => Instant::now() + IDLE,
            };
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(frame) => self.apkes.on_frame(frame),
                    None => break,
                },
                () = time::sleep_until(deadline) => {}
            }
        }
        self.apkes
    }
}
