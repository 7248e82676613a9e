//! Fixed-rate show engine
//!
//! One tokio task owns the [`PixelGrid`] and renders it at a fixed frame rate.
//! Each tick applies at most one pending show switch, renders every cell,
//! advances logical time, publishes an immutable [`Frame`], and then calls the
//! registered observers in registration order.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::grid::{Frame, PixelGrid, Rgb};
use super::patterns::{PatternContext, PatternFn, ShowRegistry};
use crate::state::ConversationSignals;
use crate::{Error, Result};

/// How long `stop` waits for the tick task to exit
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Highest accepted frame rate; the tick period must stay above zero
pub const MAX_FPS: u32 = 1_000;

/// Panel geometry and frame rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub width: usize,
    pub height: usize,
    /// Maximum frames per second
    pub fps: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: 20,
            height: 10,
            fps: 30,
        }
    }
}

/// Receives every rendered frame
///
/// Called on the tick task, so implementations must return quickly.
pub trait FrameObserver: Send + Sync {
    fn on_frame(&self, frame: &Arc<Frame>);
}

/// Handle returned by [`ShowEngine::register_frame_callback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct ObserverList {
    next_id: u64,
    entries: Vec<(ObserverId, Weak<dyn FrameObserver>)>,
}

struct Shared {
    observers: Mutex<ObserverList>,
    active: Mutex<Arc<str>>,
    logical_time: AtomicU64,
    frames_rendered: AtomicU64,
    observer_panics: AtomicU64,
    frames: watch::Sender<Arc<Frame>>,
}

impl Shared {
    fn notify(&self, frame: &Arc<Frame>) {
        // Upgrade under the lock, call outside it so observers may unregister
        let live: Vec<Arc<dyn FrameObserver>> = {
            let mut list = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            list.entries.retain(|(_, weak)| weak.strong_count() > 0);
            list.entries.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };

        for observer in live {
            // A faulty observer must not take the tick loop or its peers down
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| observer.on_frame(frame)));
            if let Err(payload) = delivered {
                let failures = self.observer_panics.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == 1 || failures.is_power_of_two() {
                    tracing::error!(
                        tick = frame.tick,
                        failures,
                        panic = panic_message(payload.as_ref()),
                        "frame observer panicked"
                    );
                }
            }
        }
    }

    fn set_active(&self, name: Arc<str>) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = name;
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Renders shows onto the panel at a fixed rate
pub struct ShowEngine {
    registry: Arc<ShowRegistry>,
    signals: Arc<ConversationSignals>,
    config: EngineConfig,
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Arc<str>>,
    pending_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<str>>>>,
    /// Most recently requested show, used to coalesce duplicate switches
    target: Mutex<Option<Arc<str>>>,
    running: Mutex<Option<Running>>,
    /// Cancelled once the tick task has exited, however it ended
    exited: CancellationToken,
}

impl ShowEngine {
    /// Create an engine; nothing renders until [`start`](Self::start)
    ///
    /// # Errors
    ///
    /// Returns error if the panel size is zero or the frame rate is outside
    /// `1..=MAX_FPS`
    pub fn new(
        registry: ShowRegistry,
        signals: Arc<ConversationSignals>,
        config: EngineConfig,
    ) -> Result<Self> {
        if !(1..=MAX_FPS).contains(&config.fps) {
            return Err(Error::Config(format!(
                "fps must be between 1 and {MAX_FPS}, got {}",
                config.fps
            )));
        }
        let blank = PixelGrid::new(config.width, config.height)?;

        let (frames, _) = watch::channel(Arc::new(Frame {
            grid: blank,
            tick: 0,
            show: Arc::from(""),
        }));
        let (requests, pending_rx) = mpsc::unbounded_channel();

        Ok(Self {
            registry: Arc::new(registry),
            signals,
            config,
            shared: Arc::new(Shared {
                observers: Mutex::new(ObserverList::default()),
                active: Mutex::new(Arc::from("")),
                logical_time: AtomicU64::new(0),
                frames_rendered: AtomicU64::new(0),
                observer_panics: AtomicU64::new(0),
                frames,
            }),
            requests,
            pending_rx: Mutex::new(Some(pending_rx)),
            target: Mutex::new(None),
            running: Mutex::new(None),
            exited: CancellationToken::new(),
        })
    }

    /// Begin ticking with `initial` as the active show
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `initial` is not registered or the engine was
    /// already started
    pub fn start(&self, initial: &str) -> Result<()> {
        let generator = self
            .registry
            .get(initial)
            .ok_or_else(|| Error::Config(format!("initial show not registered: {initial}")))?;

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(Error::Config("show engine already started".to_string()));
        }
        let requests = self
            .pending_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(Error::Stopped("show engine"))?;

        let name: Arc<str> = Arc::from(initial);
        self.shared.set_active(Arc::clone(&name));
        {
            let mut target = self.target.lock().unwrap_or_else(|e| e.into_inner());
            if target.is_none() {
                *target = Some(Arc::clone(&name));
            }
        }

        let grid = PixelGrid::new(self.config.width, self.config.height)?;
        let cancel = CancellationToken::new();
        let task = TickTask {
            registry: Arc::clone(&self.registry),
            signals: Arc::clone(&self.signals),
            shared: Arc::clone(&self.shared),
            requests,
            grid,
            active: (name, generator),
            period: Duration::from_secs(1) / self.config.fps,
            faulted: false,
        };
        let exited = self.exited.clone().drop_guard();
        let tick_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let _exited = exited;
            task.run(tick_cancel).await;
        });

        tracing::info!(
            show = initial,
            width = self.config.width,
            height = self.config.height,
            fps = self.config.fps,
            "show engine started"
        );

        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Request a switch to another show
    ///
    /// Returns `Ok(false)` when `name` is already the active (or most recently
    /// requested) show. Otherwise the switch is applied on the next tick.
    ///
    /// # Errors
    ///
    /// Returns `UnknownShow` if `name` is not registered; the active show is
    /// left unchanged
    pub fn switch_show(&self, name: &str) -> Result<bool> {
        if !self.registry.contains(name) {
            return Err(Error::UnknownShow(name.to_string()));
        }

        let mut target = self.target.lock().unwrap_or_else(|e| e.into_inner());
        if target.as_deref() == Some(name) {
            return Ok(false);
        }

        let name: Arc<str> = Arc::from(name);
        self.requests
            .send(Arc::clone(&name))
            .map_err(|_| Error::Stopped("show engine"))?;
        tracing::debug!(show = %name, "show switch requested");
        *target = Some(name);
        Ok(true)
    }

    /// Add an observer called once per tick after the frame is complete
    ///
    /// Only a weak reference is kept; dropping the last `Arc` unregisters it.
    pub fn register_frame_callback(&self, observer: &Arc<dyn FrameObserver>) -> ObserverId {
        let mut list = self.shared.observers.lock().unwrap_or_else(|e| e.into_inner());
        let id = ObserverId(list.next_id);
        list.next_id += 1;
        list.entries.push((id, Arc::downgrade(observer)));
        id
    }

    /// Remove an observer; returns false if it was not registered
    pub fn unregister_frame_callback(&self, id: ObserverId) -> bool {
        let mut list = self.shared.observers.lock().unwrap_or_else(|e| e.into_inner());
        let before = list.entries.len();
        list.entries.retain(|(entry, _)| *entry != id);
        list.entries.len() != before
    }

    /// Latest published frame, updated once per tick
    #[must_use]
    pub fn subscribe_frames(&self) -> watch::Receiver<Arc<Frame>> {
        self.shared.frames.subscribe()
    }

    /// Name of the show currently being rendered
    #[must_use]
    pub fn active_show(&self) -> Arc<str> {
        Arc::clone(&self.shared.active.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Number of ticks rendered so far
    #[must_use]
    pub fn logical_time(&self) -> u64 {
        self.shared.logical_time.load(Ordering::Acquire)
    }

    /// Total frames published
    #[must_use]
    pub fn frames_rendered(&self) -> u64 {
        self.shared.frames_rendered.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn config(&self) -> EngineConfig {
        self.config
    }

    #[must_use]
    pub fn registry(&self) -> &ShowRegistry {
        &self.registry
    }

    /// Whether the tick task is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Stop ticking and wait for the task to exit
    ///
    /// The in-flight tick completes first. Calling this again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the task does not exit within the grace
    /// period
    pub async fn stop(&self) -> Result<()> {
        let (running, never_started) = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            // Also refuse later starts
            let unused = self.pending_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
            (running.take(), unused.is_some())
        };

        let Some(Running { cancel, handle }) = running else {
            if never_started {
                self.exited.cancel();
            }
            // Another caller is joining the task; return once it is gone
            return tokio::time::timeout(STOP_GRACE, self.exited.cancelled())
                .await
                .map_err(|_| Error::ShutdownTimeout {
                    component: "show engine",
                    grace: STOP_GRACE,
                });
        };

        cancel.cancel();
        match tokio::time::timeout(STOP_GRACE, handle).await {
            Ok(Ok(())) => {
                tracing::info!(frames = self.frames_rendered(), "show engine stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "show engine task failed");
                Err(Error::WorkerFailed {
                    component: "show engine",
                    reason: e.to_string(),
                })
            }
            Err(_) => Err(Error::ShutdownTimeout {
                component: "show engine",
                grace: STOP_GRACE,
            }),
        }
    }
}

impl Drop for ShowEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            running.cancel.cancel();
        }
    }
}

struct TickTask {
    registry: Arc<ShowRegistry>,
    signals: Arc<ConversationSignals>,
    shared: Arc<Shared>,
    requests: mpsc::UnboundedReceiver<Arc<str>>,
    grid: PixelGrid,
    active: (Arc<str>, PatternFn),
    period: Duration,
    /// Set once the active generator has panicked, to log it only once
    faulted: bool,
}

impl TickTask {
    async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        // An overrun tick skips the sleep but is never skipped itself
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut t: u64 = 0;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.apply_pending_switch();

            self.render(t);
            let name = &self.active.0;
            let frame = Arc::new(Frame {
                grid: self.grid.clone(),
                tick: t,
                show: Arc::clone(name),
            });

            t += 1;
            self.shared.logical_time.store(t, Ordering::Release);
            self.shared.frames_rendered.fetch_add(1, Ordering::AcqRel);
            self.shared.frames.send_replace(Arc::clone(&frame));
            self.shared.notify(&frame);
        }

        tracing::debug!(ticks = t, "tick loop exited");
    }

    /// Render the active show, blanking the grid if its generator panics
    fn render(&mut self, t: u64) {
        let (name, generator) = &self.active;
        let grid = &mut self.grid;
        let signals = &self.signals;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            render_frame(generator, grid, t, signals);
        }));

        if let Err(payload) = result {
            self.grid.fill(Rgb::BLACK);
            if !self.faulted {
                self.faulted = true;
                tracing::error!(
                    show = %name,
                    tick = t,
                    panic = panic_message(payload.as_ref()),
                    "show generator panicked, rendering black"
                );
            }
        }
    }

    fn apply_pending_switch(&mut self) {
        let Ok(name) = self.requests.try_recv() else {
            return;
        };
        if *name == *self.active.0 {
            return;
        }
        // Names are validated on enqueue; the registry is immutable after start
        if let Some(generator) = self.registry.get(&name) {
            tracing::info!(from = %self.active.0, to = %name, "switched show");
            self.shared.set_active(Arc::clone(&name));
            self.active = (name, generator);
            self.faulted = false;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic")
}

/// Evaluate `generator` for every cell of `grid` at logical time `t`
pub fn render_frame(
    generator: &PatternFn,
    grid: &mut PixelGrid,
    t: u64,
    signals: &ConversationSignals,
) {
    let ctx = PatternContext {
        width: grid.width(),
        height: grid.height(),
        signals,
    };
    for y in 0..ctx.height {
        for x in 0..ctx.width {
            grid.set(x, y, generator(x, y, t, &ctx));
        }
    }
}
