//! Latest-wins frame transmitter
//!
//! `submit` drops the frame into a single slot and returns. A dedicated
//! worker thread takes whatever is in the slot, encodes it, and writes it to
//! the link. If a new frame arrives before the worker gets to the previous
//! one, the previous one is replaced: the panel may skip frames, but the
//! caller never blocks and memory never grows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::encoder::FrameEncoder;
use super::link::{ByteLink, SerialLink};
use crate::show::{Frame, FrameObserver};
use crate::{Error, Result};

/// Upper bound on one idle wait before the worker rechecks the stop flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `stop` waits for the worker to finish its current write
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Slot {
    pending: Option<Arc<Frame>>,
    stop: bool,
    exited: bool,
}

#[derive(Default)]
struct Inner {
    slot: Mutex<Slot>,
    changed: Condvar,
    submitted: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    write_errors: AtomicU64,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Streams frames to an LED controller over a [`ByteLink`]
pub struct DeviceTransmitter {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    address: String,
}

impl DeviceTransmitter {
    /// Open a serial link and start the worker
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the port cannot be opened
    pub fn open(address: &str, baud: u32, encoder: FrameEncoder) -> Result<Self> {
        let link = SerialLink::open(address, baud)?;
        Self::with_link(Box::new(link), encoder)
    }

    /// Start the worker on an already-open link
    ///
    /// # Errors
    ///
    /// Returns error if the worker thread cannot be spawned
    pub fn with_link(link: Box<dyn ByteLink>, encoder: FrameEncoder) -> Result<Self> {
        let inner = Arc::new(Inner::default());
        let address = link.address().to_string();

        let worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("panel-tx".to_string())
                .spawn(move || transmit_loop(&inner, link, &encoder))?
        };

        tracing::debug!(address = %address, "transmitter worker started");

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
            address,
        })
    }

    /// Offer the latest frame for transmission
    ///
    /// Replaces any frame the worker has not picked up yet. Returns false if
    /// the transmitter has been stopped.
    pub fn submit(&self, frame: Arc<Frame>) -> bool {
        let mut slot = self.inner.lock();
        if slot.stop {
            return false;
        }
        if slot.pending.replace(frame).is_some() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        drop(slot);
        self.inner.changed.notify_all();
        true
    }

    /// Frames waiting for the worker (never more than one)
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        usize::from(self.inner.lock().pending.is_some())
    }

    /// Frames accepted by `submit`
    #[must_use]
    pub fn frames_submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    /// Frames written to the link
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    /// Frames replaced before they were sent
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Failed link writes
    #[must_use]
    pub fn write_errors(&self) -> u64 {
        self.inner.write_errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stop the worker after its current write and join it
    ///
    /// A frame still waiting in the slot is discarded. Every caller, including
    /// one racing another `stop`, returns only after the worker has exited.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the worker is still inside a write when
    /// the grace period ends, or `WorkerFailed` if it panicked
    pub fn stop(&self) -> Result<()> {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();

        let mut slot = self.inner.lock();
        slot.stop = true;
        slot.pending = None;
        self.inner.changed.notify_all();

        let deadline = Instant::now() + STOP_GRACE;
        while !slot.exited {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(address = %self.address, "transmitter worker did not exit");
                return Err(Error::ShutdownTimeout {
                    component: "device transmitter",
                    grace: STOP_GRACE,
                });
            }
            slot = self
                .inner
                .changed
                .wait_timeout(slot, remaining)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        drop(slot);

        // Only the caller that took the handle joins and reports
        let Some(worker) = worker else {
            return Ok(());
        };
        if worker.join().is_err() {
            tracing::error!(address = %self.address, "transmitter worker panicked");
            return Err(Error::WorkerFailed {
                component: "device transmitter",
                reason: "worker thread panicked".to_string(),
            });
        }
        tracing::info!(
            address = %self.address,
            sent = self.frames_sent(),
            dropped = self.frames_dropped(),
            "transmitter stopped"
        );
        Ok(())
    }
}

impl FrameObserver for DeviceTransmitter {
    fn on_frame(&self, frame: &Arc<Frame>) {
        self.submit(Arc::clone(frame));
    }
}

impl Drop for DeviceTransmitter {
    fn drop(&mut self) {
        let mut slot = self.inner.lock();
        slot.stop = true;
        slot.pending = None;
        drop(slot);
        self.inner.changed.notify_all();
    }
}

/// Marks the worker as exited when dropped, including during a panic
struct ExitMark<'a>(&'a Inner);

impl Drop for ExitMark<'_> {
    fn drop(&mut self) {
        let mut slot = self.0.lock();
        slot.exited = true;
        drop(slot);
        self.0.changed.notify_all();
    }
}

fn transmit_loop(inner: &Inner, mut link: Box<dyn ByteLink>, encoder: &FrameEncoder) {
    let _exit = ExitMark(inner);
    let mut buf = Vec::with_capacity(encoder.frame_len());

    while let Some(frame) = next_frame(inner) {
        if let Err(e) = encoder.encode_into(&frame.grid, &mut buf) {
            tracing::error!(error = %e, tick = frame.tick, "failed to encode frame");
            continue;
        }

        match link.write_frame(&buf) {
            Ok(()) => {
                inner.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = inner.write_errors.fetch_add(1, Ordering::Relaxed) + 1;
                // A missing device fails every tick; keep the log readable
                if failures == 1 || failures.is_power_of_two() {
                    tracing::warn!(
                        address = link.address(),
                        error = %e,
                        failures,
                        "frame write failed"
                    );
                }
            }
        }
    }

    tracing::debug!("transmitter worker exited");
}

/// Block until a frame is pending or stop is requested
fn next_frame(inner: &Inner) -> Option<Arc<Frame>> {
    let mut slot = inner.lock();
    loop {
        if slot.stop {
            return None;
        }
        if let Some(frame) = slot.pending.take() {
            return Some(frame);
        }
        slot = inner
            .changed
            .wait_timeout(slot, POLL_INTERVAL)
            .unwrap_or_else(|e| e.into_inner())
            .0;
    }
}
