//! Process-scoped pause and cancel flags.
//!
//! Pause is user-facing through SIGUSR1, so it has to live in a signal
//! handler; atomics read at loop iteration boundaries are all the
//! synchronization the single-threaded engine needs. API workers share
//! the same flags, which makes the HTTP pause/cancel endpoints and the
//! signal indistinguishable to the engine.

use std::sync::atomic::{AtomicBool, Ordering};

static PAUSED: AtomicBool = AtomicBool::new(false);
static CANCEL: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_signum: libc::c_int) {
    PAUSED.fetch_xor(true, Ordering::Relaxed);
}

/// Installs the process signal configuration:
/// - SIGUSR1 toggles pause
/// - SIGPIPE is ignored so broken pipes surface as EPIPE on write
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(
            libc::SIGUSR1,
            on_sigusr1 as *const () as libc::sighandler_t,
        );
    }
}

/// True while streaming from the source should be suspended.
pub fn is_paused() -> bool {
    PAUSED.load(Ordering::Relaxed)
}

pub fn toggle_pause() {
    PAUSED.fetch_xor(true, Ordering::Relaxed);
}

pub fn set_paused(on: bool) {
    PAUSED.store(on, Ordering::Relaxed);
}

/// True if the current job should end at the next iteration boundary.
pub fn cancel_requested() -> bool {
    CANCEL.load(Ordering::Relaxed)
}

pub fn request_cancel() {
    CANCEL.store(true, Ordering::Relaxed);
}

/// Clears both flags. Called when a new job starts.
pub fn reset() {
    PAUSED.store(false, Ordering::Relaxed);
    CANCEL.store(false, Ordering::Relaxed);
}
