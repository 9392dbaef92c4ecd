//! Per-thread exit hook.
//!
//! Subscribing arms a thread-local guard whose destructor runs when the
//! thread terminates, so a thread that exits without unsubscribing is
//! still removed from the registry (and a parked peer can be chosen in
//! its place). Explicit unsubscription disarms the guard first.

use std::cell::RefCell;
use std::sync::Weak;

use crate::governor::Inner;

thread_local! {
    static EXIT_GUARD: RefCell<Option<ExitGuard>> = const { RefCell::new(None) };
}

struct ExitGuard {
    governor: Weak<Inner>,
    armed: bool,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(inner) = self.governor.upgrade() {
            if let Err(err) = inner.unsubscribe_current() {
                // A dying thread has no caller to return this to. The
                // halt keeps the rendered cause for parked peers; the
                // full diagnostic still reaches standard error.
                eprintln!("lockstep: {err}");
            }
        }
    }
}

/// Arm the hook for the calling thread. Called during subscription.
pub(crate) fn arm(governor: Weak<Inner>) {
    EXIT_GUARD.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(existing) = slot.as_mut() {
            existing.armed = false;
        }
        *slot = Some(ExitGuard {
            governor,
            armed: true,
        });
    });
}

/// Disarm without firing. Called by explicit unsubscription.
pub(crate) fn disarm() {
    EXIT_GUARD.with(|slot| {
        if let Some(guard) = slot.borrow_mut().as_mut() {
            guard.armed = false;
        }
    });
}
