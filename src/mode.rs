//! Execute-mode tracker: ambient scheduling context for the current thread.
//!
//! A small fixed set of flags records whether work is currently running
//! synchronously, asynchronously, inside a render pass, or inside a direct
//! event-response pass. New update requests consult these flags to decide
//! whether to arm the background driver or leave the work queued for the
//! pass already running.
//!
//! Flags are only ever mutated through [`ModeGuard`], a scoped-acquisition
//! guard that restores the previous flag set on every exit path, including
//! unwinding, so the flag set can never leak a "still active" bit past a
//! panic. [`snapshot`]/[`restore`] exist for reentrant scheduling: a
//! synchronous flush requested mid-async-pass saves the outer set, forces
//! its own, and restores the outer set afterward.

use std::cell::Cell;

use bitflags::bitflags;

bitflags! {
    /// The ambient scheduling contexts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecuteMode: u8 {
        /// A synchronous flush is draining the queue on this thread.
        const SYNC = 1 << 0;
        /// The cooperative driver is processing tasks.
        const ASYNC = 1 << 1;
        /// A component render is producing descriptions.
        const RENDER = 1 << 2;
        /// A direct event-response pass is running.
        const EVENT = 1 << 3;
    }
}

thread_local! {
    static ACTIVE_MODES: Cell<ExecuteMode> = const { Cell::new(ExecuteMode::empty()) };
}

/// Whether the given mode is currently active on this thread.
pub fn is_active(mode: ExecuteMode) -> bool {
    ACTIVE_MODES.with(|m| m.get().intersects(mode))
}

/// Whether any work is executing on this thread.
///
/// True iff at least one flag is set; gates whether a newly created task can
/// run immediately or must be queued.
pub fn is_any_active() -> bool {
    ACTIVE_MODES.with(|m| !m.get().is_empty())
}

/// Capture the current flag set.
pub fn snapshot() -> ExecuteMode {
    ACTIVE_MODES.with(Cell::get)
}

/// Overwrite the flag set wholesale.
///
/// Pair with [`snapshot`]; prefer [`ModeGuard`] anywhere a scope is
/// available.
pub fn restore(state: ExecuteMode) {
    ACTIVE_MODES.with(|m| m.set(state));
}

/// RAII guard that activates modes on creation and restores the previous
/// flag set when dropped.
#[must_use = "dropping the guard immediately exits the mode"]
pub struct ModeGuard {
    previous: ExecuteMode,
}

impl ModeGuard {
    /// Activate `mode` in addition to whatever is already active.
    pub fn enter(mode: ExecuteMode) -> Self {
        let previous = snapshot();
        restore(previous | mode);
        Self { previous }
    }

    /// Activate exactly `mode`, masking the outer flag set until drop.
    ///
    /// Used by reentrant synchronous flushes that must not observe the
    /// enclosing pass's flags.
    pub fn enter_exclusive(mode: ExecuteMode) -> Self {
        let previous = snapshot();
        restore(mode);
        Self { previous }
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        restore(self.previous);
    }
}

/// Run `f` with `mode` active, restoring the previous set afterwards.
pub fn scoped<F, R>(mode: ExecuteMode, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ModeGuard::enter(mode);
    f()
}
