//! Cooperative driver loop for time-sliced reconciliation.
//!
//! The scheduler owns a single logical driver slot. [`request_callback`]
//! registers a driver closure; a later request replaces the previous one, so
//! only one driver is ever in flight. A background loop thread invokes the
//! driver once per macrotask boundary (one channel receive per boundary) and
//! re-arms itself as long as the driver reports more work. Between
//! invocations the loop returns to its channel, so host-side work queued on
//! other threads is never starved the way a busy loop would starve it.
//!
//! The driver receives a [`TimeSlice`] and is responsible for checking it
//! between discrete units of work, returning `true` once the slice is
//! exhausted with work remaining.
//!
//! ## Architecture
//!
//! 1. `request_callback()` stores the driver and notifies the loop
//! 2. The loop wakes, drains coalesced notifications, and counts one tick
//! 3. The driver runs once against a fresh time slice
//! 4. `true` re-arms the next tick; `false` clears the driver slot
//!
//! A drop guard re-registers the driver and re-arms the loop before a driver
//! panic propagates, so a single failing unit of work cannot wedge the
//! scheduler.
//!
//! ## Harness fallback
//!
//! In an environment without the loop thread (tests, synchronous hosts),
//! notifications are no-ops and [`drive_to_completion`] (or the crate-level
//! `flush_pending_work()`) drains the work synchronously with identical
//! observable ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{LazyLock, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default time budget for one driver slice.
///
/// Short enough that input handling scheduled between slices stays
/// responsive; the driver checks elapsed time between tasks, never inside
/// one.
pub const DEFAULT_BUDGET: Duration = Duration::from_millis(5);

/// Deadline handed to the driver for one slice.
#[derive(Debug, Clone, Copy)]
pub struct TimeSlice {
    start: Instant,
    budget: Duration,
}

impl TimeSlice {
    /// Start a slice with the given budget.
    pub fn new(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    /// Whether the budget is spent.
    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    /// Budget left in this slice.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }
}

/// The driver signature: run up to one slice of work, report whether more
/// remains.
pub type Driver = Box<dyn FnMut(&TimeSlice) -> bool + Send>;

/// The single logical driver slot. Later registrations replace earlier ones.
static DRIVER_SLOT: LazyLock<Mutex<Option<Driver>>> = LazyLock::new(|| Mutex::new(None));

/// Sender half of the loop's wake channel; set once when the loop spawns.
static LOOP_NOTIFIER: OnceLock<Sender<()>> = OnceLock::new();

/// Macrotask boundaries crossed so far. Observable by tests to verify the
/// loop actually yields between driver invocations.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Register `driver` as the scheduler's driver, replacing any previous one,
/// and arrange an invocation on the next macrotask boundary.
pub fn request_callback<F>(driver: F)
where
    F: FnMut(&TimeSlice) -> bool + Send + 'static,
{
    *DRIVER_SLOT.lock() = Some(Box::new(driver));
    notify_driver_loop();
}

/// Wake the driver loop. No-op when no loop has been spawned.
pub fn notify_driver_loop() {
    if let Some(sender) = LOOP_NOTIFIER.get() {
        // Send errors mean the loop stopped; nothing to wake.
        let _ = sender.send(());
    }
}

/// Whether a driver is currently registered.
pub fn has_pending_driver() -> bool {
    DRIVER_SLOT.lock().is_some()
}

/// Macrotask boundaries crossed since startup.
pub fn ticks_crossed() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Restores the driver to the slot on drop unless disarmed.
///
/// Covers the panic path: if the driver unwinds mid-invocation, the guard
/// re-registers it and re-arms the loop before the panic propagates.
struct RearmGuard {
    driver: Option<Driver>,
}

impl Drop for RearmGuard {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            *DRIVER_SLOT.lock() = Some(driver);
            notify_driver_loop();
        }
    }
}

/// Invoke the registered driver once against `slice`.
///
/// Returns `true` when a driver ran and reported more work (in which case it
/// was re-registered and the loop re-armed); `false` when the slot was empty
/// or the driver finished.
pub(crate) fn run_driver_once(slice: &TimeSlice) -> bool {
    let Some(driver) = DRIVER_SLOT.lock().take() else {
        return false;
    };

    let mut guard = RearmGuard {
        driver: Some(driver),
    };
    let has_more = match guard.driver.as_mut() {
        Some(driver) => driver(slice),
        None => false,
    };

    if has_more {
        // Guard's drop re-registers and notifies.
        true
    } else {
        // Finished: drop the driver without re-arming.
        guard.driver = None;
        false
    }
}

/// Synchronously run the registered driver to completion.
///
/// Each iteration gets a fresh slice, mirroring the loop thread's behavior
/// without the macrotask gaps. This is the harness substitute for hosts
/// without the loop thread.
pub fn drive_to_completion(budget: Duration) {
    while run_driver_once(&TimeSlice::new(budget)) {}
}

/// Builder for configuring and spawning the driver loop thread.
///
/// # Example
///
/// ```ignore
/// DriverLoop::new()
///     .budget(Duration::from_millis(8))
///     .spawn_fn(|f| {
///         std::thread::Builder::new()
///             .name("reconcile-driver".into())
///             .spawn(f)
///             .unwrap()
///     })
///     .spawn();
/// ```
#[allow(clippy::type_complexity)]
pub struct DriverLoop {
    budget: Duration,
    spawn_fn: Option<Box<dyn FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send>>,
}

impl Default for DriverLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverLoop {
    /// Create a builder with the default budget and `std::thread::spawn`.
    pub fn new() -> Self {
        Self {
            budget: DEFAULT_BUDGET,
            spawn_fn: None,
        }
    }

    /// Set the per-slice time budget.
    pub fn budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Set a custom thread-spawning function (name, stack size, priority).
    pub fn spawn_fn<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send + 'static,
    {
        self.spawn_fn = Some(Box::new(f));
        self
    }

    /// Spawn the loop thread.
    ///
    /// When no driver is registered the loop blocks on its channel,
    /// consuming no CPU.
    pub fn spawn(self) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel::<()>();
        let _ = LOOP_NOTIFIER.set(tx);

        let budget = self.budget;
        let loop_fn: Box<dyn FnOnce() + Send> = Box::new(move || {
            driver_loop(rx, budget);
        });

        match self.spawn_fn {
            Some(spawn_fn) => spawn_fn(loop_fn),
            None => thread::spawn(loop_fn),
        }
    }
}

/// The loop body: one channel receive per macrotask boundary.
fn driver_loop(rx: Receiver<()>, budget: Duration) {
    loop {
        if rx.recv().is_err() {
            // Channel closed, exit loop.
            break;
        }

        // Coalesce every notification that piled up into this one tick.
        loop {
            match rx.try_recv() {
                Ok(()) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        TICKS.fetch_add(1, Ordering::Relaxed);

        // A panicking driver was already re-registered by the rearm guard;
        // report it and keep the loop alive for unrelated work.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_driver_once(&TimeSlice::new(budget));
        }));
        if outcome.is_err() {
            log::error!("driver panicked; scheduler re-armed for the next tick");
        }
    }
}

/// Serializes tests that touch the global driver slot.
#[cfg(test)]
pub(crate) static TEST_DRIVER_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn later_request_replaces_earlier_driver() {
        let _serial = TEST_DRIVER_LOCK.lock();
        let first_runs = Arc::new(AtomicUsize::new(0));
        let second_runs = Arc::new(AtomicUsize::new(0));

        let first = first_runs.clone();
        request_callback(move |_slice| {
            first.fetch_add(1, Ordering::Relaxed);
            false
        });
        let second = second_runs.clone();
        request_callback(move |_slice| {
            second.fetch_add(1, Ordering::Relaxed);
            false
        });

        drive_to_completion(DEFAULT_BUDGET);

        assert_eq!(first_runs.load(Ordering::Relaxed), 0);
        assert_eq!(second_runs.load(Ordering::Relaxed), 1);
        assert!(!has_pending_driver());
    }

    #[test]
    fn driver_reporting_more_work_is_reinvoked() {
        let _serial = TEST_DRIVER_LOCK.lock();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        request_callback(move |_slice| {
            let n = runs_clone.fetch_add(1, Ordering::Relaxed) + 1;
            n < 3
        });

        drive_to_completion(DEFAULT_BUDGET);

        assert_eq!(runs.load(Ordering::Relaxed), 3);
        assert!(!has_pending_driver());
    }

    #[test]
    fn panicking_driver_is_rearmed_before_propagating() {
        let _serial = TEST_DRIVER_LOCK.lock();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        request_callback(move |_slice| {
            if runs_clone.fetch_add(1, Ordering::Relaxed) == 0 {
                panic!("unit of work failed");
            }
            false
        });

        let result = std::panic::catch_unwind(|| {
            run_driver_once(&TimeSlice::new(DEFAULT_BUDGET));
        });
        assert!(result.is_err());
        // The guard re-registered the driver; the next invocation completes.
        assert!(has_pending_driver());
        drive_to_completion(DEFAULT_BUDGET);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        assert!(!has_pending_driver());
    }

    #[test]
    fn loop_body_yields_one_tick_per_notification_under_load() {
        let _serial = TEST_DRIVER_LOCK.lock();
        let ticks_before = ticks_crossed();

        // Drive the loop body over a private channel so each notification is
        // exactly one macrotask boundary.
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || driver_loop(rx, Duration::from_millis(1)));

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        request_callback(move |_slice| {
            let n = runs_clone.fetch_add(1, Ordering::Relaxed) + 1;
            n < 5
        });

        for expected in 1..=5usize {
            tx.send(()).unwrap();
            for _ in 0..500 {
                if runs.load(Ordering::Relaxed) >= expected {
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
            assert_eq!(runs.load(Ordering::Relaxed), expected);
        }

        assert!(!has_pending_driver());
        assert!(ticks_crossed() - ticks_before >= 5);

        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn time_slice_expires_after_budget() {
        let slice = TimeSlice::new(Duration::ZERO);
        assert!(slice.expired());
        assert_eq!(slice.remaining(), Duration::ZERO);

        let generous = TimeSlice::new(Duration::from_secs(3600));
        assert!(!generous.expired());
    }
}
