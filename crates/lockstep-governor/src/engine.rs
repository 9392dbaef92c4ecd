//! Decision engine: which subscribed thread runs next, per mode.
//!
//! The three modes share one `choose` contract; the branch between them
//! lives here and nowhere else. Random and explore decisions are
//! appended to the log as they are made, so the store always describes
//! the run in progress; preset decisions are validated against the live
//! thread set and never written.

use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use lockstep_schedule::{SchedPoint, Schedule, ScheduleLog};

use crate::error::{GovernorError, ScheduleError};
use crate::mode::RunMode;
use crate::registry::ThreadRegistry;

/// Mode-specific decision state.
#[derive(Debug)]
enum Decider {
    /// Uniform choice among live ids, driven by a seeded PRNG.
    Random { rng: ChaCha20Rng },
    /// Depth-first enumeration over stored prefixes.
    Explore,
    /// Strict replay of the stored schedule.
    Preset,
}

/// Chooses the next runner and maintains the schedule while doing so.
#[derive(Debug)]
pub struct DecisionEngine {
    decider: Decider,
    schedule: Schedule,
}

impl DecisionEngine {
    pub fn new(mode: RunMode, seed: u64) -> DecisionEngine {
        let decider = match mode {
            RunMode::Random => Decider::Random {
                rng: ChaCha20Rng::seed_from_u64(seed),
            },
            RunMode::Explore => Decider::Explore,
            RunMode::Preset => Decider::Preset,
        };
        DecisionEngine {
            decider,
            schedule: Schedule::new(),
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut Schedule {
        &mut self.schedule
    }

    /// Swap in a schedule freshly loaded from the log.
    pub fn replace_schedule(&mut self, schedule: Schedule) {
        self.schedule = schedule;
    }

    /// Decide which subscribed thread runs next and advance the cursor.
    ///
    /// The registry must not be empty; the state machine guarantees it.
    pub fn choose(
        &mut self,
        registry: &ThreadRegistry,
        log: &mut ScheduleLog,
    ) -> Result<usize, GovernorError> {
        assert!(!registry.is_empty(), "choose with no subscribed threads");

        let index = self.schedule.cursor();
        let line = index + 1;

        let point = match &mut self.decider {
            Decider::Random { rng } => {
                let ids: Vec<usize> = registry.user_ids().collect();
                let thread_id = ids[rng.gen_range(0..ids.len())];
                let point =
                    SchedPoint::new(thread_id, ids.len(), registry.count_higher(thread_id));
                self.schedule.push(point);
                log.append(&point)?;
                point
            }

            Decider::Explore => {
                let mut point = match self.schedule.get(index) {
                    Some(point) => *point,
                    None => {
                        // Past the stored prefix: take the smallest live id.
                        let available = registry.len();
                        let thread_id =
                            registry.first_id().expect("registry checked non-empty");
                        let point = SchedPoint::new(thread_id, available, available - 1);
                        self.schedule.push(point);
                        point
                    }
                };

                if self.schedule.is_tail(index) {
                    // The tail was produced by a frontier advance and may
                    // name a gap in the live id set; redirect to the
                    // smallest subscribed id at or above it.
                    let thread_id = registry
                        .first_id_at_or_above(point.thread_id)
                        .ok_or(ScheduleError::NoCandidate {
                            line,
                            thread_id: point.thread_id,
                        })?;
                    if thread_id != point.thread_id {
                        debug!(
                            "record {line}: redirected id {} to {thread_id}",
                            point.thread_id
                        );
                        point.thread_id = thread_id;
                        self.schedule.set(index, point);
                    }
                }

                log.append(&point)?;
                point
            }

            Decider::Preset => {
                let point = *self
                    .schedule
                    .get(index)
                    .ok_or(ScheduleError::MissingPoint { line })?;

                if !registry.contains_id(point.thread_id) {
                    return Err(ScheduleError::UnknownThread {
                        line,
                        thread_id: point.thread_id,
                    }
                    .into());
                }
                if point.available != registry.len() {
                    return Err(ScheduleError::WrongAvailable {
                        line,
                        recorded: point.available,
                        live: registry.len(),
                    }
                    .into());
                }
                let higher = registry.count_higher(point.thread_id);
                if point.higher != higher {
                    return Err(ScheduleError::WrongHigher {
                        line,
                        recorded: point.higher,
                        live: higher,
                    }
                    .into());
                }
                point
            }
        };

        self.schedule.advance_cursor();
        debug!(
            "decision {line}: thread {} of {} available",
            point.thread_id, point.available
        );
        Ok(point.thread_id)
    }

    /// Move the stored schedule to the next unexplored one (between
    /// runs, explore mode only). `false` when the space is exhausted.
    pub fn advance_frontier(&mut self) -> bool {
        debug_assert!(matches!(self.decider, Decider::Explore));
        let advanced = self.schedule.advance_frontier();
        if advanced {
            debug!(
                "frontier advanced; stored prefix is {} records",
                self.schedule.len()
            );
        }
        advanced
    }
}
