//! Deterministic scheduling controller for lock-free multi-threaded
//! programs.
//!
//! The governor makes the interleaving of atomic operations
//! reproducible: the program under test marks each observable
//! shared-memory step with a *control point*, and at every control
//! point the governor decides which subscribed thread proceeds next,
//! parking all others. Schedule-dependent bugs can then be captured,
//! replayed, and systematically enumerated.
//!
//! # Protocol
//!
//! ```text
//! prepare(N)                 arm the controller for N participants
//!   N × subscribe(id)        each participating thread registers
//!   ... control_point() ...  before every shared-memory step
//!   N × unsubscribe()        each thread deregisters (or just exits)
//! reset() -> bool            move to the next run; false = all done
//! ```
//!
//! Scheduling starts once all `N` threads have subscribed and every one
//! of them is parked at a control point; from then on exactly one
//! subscribed thread executes at a time. Subscribed threads must never
//! depend on another thread's progress (no locks, no joins) between
//! control points — that is the lock-freedom assumption that makes the
//! whole scheme sound.
//!
//! # Modes
//!
//! `GOV_MODE` selects how decisions are made (see [`mode`]):
//!
//! - **random** — pick uniformly among live threads, recording every
//!   decision to `gov.data` for later replay;
//! - **explore** — enumerate all schedules depth-first across runs,
//!   driving the frontier from the recorded prefix;
//! - **preset** (default) — replay `gov.data` exactly, once.
//!
//! # Example
//!
//! ```no_run
//! use std::thread;
//!
//! lockstep_governor::prepare(2);
//! let workers: Vec<_> = (1..=2)
//!     .map(|id| {
//!         thread::spawn(move || {
//!             lockstep_governor::subscribe(id);
//!             for _ in 0..100 {
//!                 lockstep_governor::control_point();
//!                 // one lock-free shared-memory step here
//!             }
//!             lockstep_governor::unsubscribe();
//!         })
//!     })
//!     .collect();
//! for worker in workers {
//!     worker.join().unwrap();
//! }
//! lockstep_governor::finalize();
//! ```
//!
//! The free functions drive a process-wide controller configured from
//! the environment and abort with a diagnostic on any fatal error
//! (unknown mode, misuse, inconsistent preset schedule). Tests and
//! embedders can instead build private [`Governor`] instances from a
//! [`GovernorConfig`] and handle the underlying `Result`s themselves.

pub mod engine;
pub mod error;
pub mod governor;
pub mod mode;
pub mod registry;

mod affinity;
mod exit_hook;

use std::sync::OnceLock;

pub use crate::error::{GovernorError, ScheduleError};
pub use crate::governor::{Governor, GovernorConfig, LOG_FILE};
pub use crate::mode::RunMode;

static GOVERNOR: OnceLock<Governor> = OnceLock::new();

/// The process-wide controller, created from the environment on first
/// use. Lives for the rest of the process; configuration and log
/// errors are fatal here.
pub fn governor() -> &'static Governor {
    GOVERNOR.get_or_init(|| {
        let config = GovernorConfig::from_env()
            .unwrap_or_else(|err| fatal(&GovernorError::Config(err)));
        Governor::new(config).unwrap_or_else(|err| fatal(&err))
    })
}

/// Arm the controller to accept `num_threads` subscribers.
pub fn prepare(num_threads: usize) {
    governor()
        .prepare(num_threads)
        .unwrap_or_else(|err| fatal(&err));
}

/// Register the calling thread under `thread_id`.
pub fn subscribe(thread_id: usize) {
    governor()
        .subscribe(thread_id)
        .unwrap_or_else(|err| fatal(&err));
}

/// Deregister the calling thread. No effect when not subscribed.
pub fn unsubscribe() {
    governor().unsubscribe().unwrap_or_else(|err| fatal(&err));
}

/// Yield to the controller; returns when it is the caller's turn.
pub fn control_point() {
    governor().control_point().unwrap_or_else(|err| fatal(&err));
}

/// Prepare the next run. Returns `true` while a run remains.
pub fn reset() -> bool {
    governor().reset().unwrap_or_else(|err| fatal(&err))
}

/// Mark the current run as cleanly completed and flush the log.
pub fn finalize() {
    governor().finalize().unwrap_or_else(|err| fatal(&err));
}

fn fatal(err: &GovernorError) -> ! {
    eprintln!("lockstep: {err}");
    std::process::abort();
}
