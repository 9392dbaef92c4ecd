//! Schedule data model for the lockstep governor.
//!
//! A *schedule* is the ordered sequence of decisions "at decision `i`,
//! thread `T_i` ran next", recorded with enough bookkeeping to drive a
//! depth-first enumeration of every possible interleaving.
//!
//! # Module structure
//!
//! - [`point`] — [`SchedPoint`], the unit record of a schedule, with its
//!   line-oriented wire format
//! - [`schedule`] — [`Schedule`], an ordered point sequence consumed
//!   through a cursor, plus the depth-first frontier advance
//! - [`store`] — [`ScheduleLog`], the memory-mapped durable store that
//!   makes schedules survive between runs
//!
//! # Determinism
//!
//! Everything here is deterministic and single-threaded; choosing which
//! thread actually runs is the governor's job. The on-disk format is
//! deliberately plain text (one record per line) so a failing schedule
//! can be inspected and hand-edited.

pub mod point;
pub mod schedule;
pub mod store;

pub use crate::point::{PointParseError, SchedPoint, END_MARKER};
pub use crate::schedule::Schedule;
pub use crate::store::{Loaded, LogError, LogTail, ScheduleLog, PAGE_SIZE};
