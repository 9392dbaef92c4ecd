//! Error types for the governor.
//!
//! Library APIs return these; the crate-root facade turns them into the
//! abort-with-diagnostic contract. There is no retry anywhere: the
//! controller's value is determinism, and silently recovering from an
//! inconsistent schedule would defeat its purpose.

use thiserror::Error;

use lockstep_schedule::LogError;

use crate::mode::ConfigError;
use crate::registry::RegistryError;

/// A stored schedule that cannot be applied to the live thread set.
///
/// Record numbers are 1-based line numbers in the schedule log.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("record {line} names thread id {thread_id}, which is not subscribed")]
    UnknownThread { line: usize, thread_id: usize },

    #[error("record {line} says {recorded} threads available, but {live} are subscribed")]
    WrongAvailable {
        line: usize,
        recorded: usize,
        live: usize,
    },

    #[error("record {line} says {recorded} ids above the chosen one, but {live} are live")]
    WrongHigher {
        line: usize,
        recorded: usize,
        live: usize,
    },

    #[error("no schedule record at line {line}")]
    MissingPoint { line: usize },

    #[error("record {line}: no subscribed thread id at or above {thread_id}")]
    NoCandidate { line: usize, thread_id: usize },
}

/// Any failure surfaced by the governor.
#[derive(Error, Debug)]
pub enum GovernorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("calling thread is already subscribed as id {thread_id}")]
    AlreadySubscribed { thread_id: usize },

    #[error("no more subscriptions expected (thread id {thread_id})")]
    NotArmed { thread_id: usize },

    #[error("prepare called while {subscribed} threads are still subscribed")]
    Busy { subscribed: usize },

    #[error("controller halted by an earlier fatal error: {reason}")]
    Halted { reason: String },
}
