//! The scheduler state machine and controller facade.
//!
//! One mutex guards all controller state; the atomic runner slot lives
//! outside it so parked threads can watch for their turn without taking
//! the lock. The lock is never held across that wait: a thread marks
//! itself parked, runs the decision step, releases the lock, and spins
//! with a yield hint until its token is published.
//!
//! The decision step only fires once every expected thread has
//! subscribed and every subscribed thread is parked, so between any two
//! control-point returns exactly one thread executes user code. The
//! program under test must uphold its side: threads make progress
//! between control points without depending on any other thread
//! (lock-freedom), which is why a plain spin is sufficient and no
//! condition variable is wanted here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{debug, error, info, warn};

use lockstep_schedule::{LogError, LogTail, Schedule, ScheduleLog};

use crate::affinity;
use crate::engine::DecisionEngine;
use crate::error::{GovernorError, ScheduleError};
use crate::exit_hook;
use crate::mode::{ConfigError, RunMode, PIN_ENV, SEED_ENV};
use crate::registry::{ThreadRegistry, ThreadState};

/// Name of the schedule log in the process working directory.
pub const LOG_FILE: &str = "gov.data";

/// Slot value meaning no thread may run.
const NO_RUNNER: u64 = 0;
/// Slot value meaning the controller hit a fatal error; parked threads
/// unwind with [`GovernorError::Halted`] instead of spinning forever.
const HALTED: u64 = u64::MAX;

/// Construction-time knobs for a controller instance.
///
/// The process-wide singleton builds one with [`GovernorConfig::from_env`];
/// tests build their own with a private log path.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub mode: RunMode,
    /// Backing file for the schedule log.
    pub log_path: PathBuf,
    /// Seed for random-mode decisions.
    pub seed: u64,
    /// Pin subscribed threads to a single CPU (diagnostic, Linux only).
    pub pin_cpu: bool,
}

impl Default for GovernorConfig {
    fn default() -> GovernorConfig {
        GovernorConfig {
            mode: RunMode::Random,
            log_path: PathBuf::from(LOG_FILE),
            seed: 0,
            pin_cpu: false,
        }
    }
}

impl GovernorConfig {
    /// Configuration from the process environment.
    ///
    /// `GOV_MODE` selects the mode (unset means preset). `GOV_SEED`
    /// fixes the random seed; without it a fresh seed is drawn and
    /// logged so the run can still be reproduced. `GOV_CPU_PIN`
    /// enables the affinity diagnostic.
    pub fn from_env() -> Result<GovernorConfig, ConfigError> {
        let mode = RunMode::from_env()?;

        let seed = match std::env::var(SEED_ENV) {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidSeed { value })?,
            Err(_) => {
                let seed = rand::random::<u64>();
                if mode == RunMode::Random {
                    info!("{SEED_ENV} not set; scheduling with seed {seed}");
                }
                seed
            }
        };

        let pin_cpu = matches!(std::env::var(PIN_ENV).as_deref(), Ok("1") | Ok("true"));

        Ok(GovernorConfig {
            mode,
            log_path: PathBuf::from(LOG_FILE),
            seed,
            pin_cpu,
        })
    }
}

#[derive(Debug)]
struct State {
    registry: ThreadRegistry,
    engine: DecisionEngine,
    log: ScheduleLog,
    /// Subscriptions still expected after prepare.
    threads_to_subscribe: usize,
    /// Next subscription token; 0 and u64::MAX are reserved slot values.
    next_token: u64,
    /// Preset schedules are single-shot; set once consumed.
    preset_consumed: bool,
    /// Explore ran out of schedules; later resets keep reporting it.
    explore_exhausted: bool,
    /// Guards against writing the completion marker twice per run.
    marker_written: bool,
    halted: bool,
    /// Rendered diagnostic of the error that halted the controller, so
    /// threads that only observe the halt can still report the cause.
    halt_reason: Option<String>,
}

impl State {
    fn halted_error(&self) -> GovernorError {
        GovernorError::Halted {
            reason: self
                .halt_reason
                .clone()
                .unwrap_or_else(|| "cause not recorded".to_owned()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Inner {
    mode: RunMode,
    pin_cpu: bool,
    state: Mutex<State>,
    /// Token of the one thread allowed to execute.
    active: AtomicU64,
}

/// Handle to a controller instance. Clones share the instance.
#[derive(Clone, Debug)]
pub struct Governor {
    inner: Arc<Inner>,
}

impl Governor {
    /// Open the schedule log and perform the birth-time reset.
    ///
    /// An unopenable log is fatal in preset mode (there is nothing to
    /// replay); in the writing modes the log is detached and decisions
    /// simply go unrecorded.
    pub fn new(config: GovernorConfig) -> Result<Governor, GovernorError> {
        let log = match ScheduleLog::open(&config.log_path) {
            Ok(log) => log,
            Err(err) if config.mode == RunMode::Preset => return Err(err.into()),
            Err(err) => {
                warn!("schedule log unavailable ({err}); decisions will not be recorded");
                ScheduleLog::detached()
            }
        };

        info!("governor starting in {:?} mode", config.mode);

        let inner = Arc::new(Inner {
            mode: config.mode,
            pin_cpu: config.pin_cpu,
            state: Mutex::new(State {
                registry: ThreadRegistry::new(),
                engine: DecisionEngine::new(config.mode, config.seed),
                log,
                threads_to_subscribe: 0,
                next_token: 1,
                preset_consumed: false,
                explore_exhausted: false,
                marker_written: false,
                halted: false,
                halt_reason: None,
            }),
            active: AtomicU64::new(NO_RUNNER),
        });

        let governor = Governor { inner };
        governor.reset_with(true)?;
        Ok(governor)
    }

    pub fn mode(&self) -> RunMode {
        self.inner.mode
    }

    /// Arm the controller to accept `num_threads` subscriptions.
    ///
    /// Scheduling stays quiescent until that many threads have
    /// subscribed. Only valid between runs, with nothing subscribed.
    pub fn prepare(&self, num_threads: usize) -> Result<(), GovernorError> {
        let mut state = self.inner.lock_state();
        if state.halted {
            return Err(state.halted_error());
        }
        if !state.registry.is_empty() {
            return Err(GovernorError::Busy {
                subscribed: state.registry.len(),
            });
        }

        debug!("prepared for {num_threads} threads");
        state.threads_to_subscribe = num_threads;
        Ok(())
    }

    /// Register the calling thread under `thread_id`.
    ///
    /// From here until unsubscription the thread must never depend on
    /// another thread's progress (no locks, no joins), and must pass a
    /// control point before every shared-memory step.
    pub fn subscribe(&self, thread_id: usize) -> Result<(), GovernorError> {
        let native = thread::current().id();
        {
            let mut state = self.inner.lock_state();
            if state.halted {
                return Err(state.halted_error());
            }
            if let Some(existing) = state.registry.get(native) {
                return Err(GovernorError::AlreadySubscribed {
                    thread_id: existing.thread_id,
                });
            }
            if state.threads_to_subscribe == 0 {
                return Err(GovernorError::NotArmed { thread_id });
            }

            let token = state.next_token;
            state.registry.insert(
                native,
                ThreadState {
                    thread_id,
                    token,
                    in_control_point: false,
                },
            )?;
            state.next_token += 1;
            state.threads_to_subscribe -= 1;
            debug!(
                "thread {thread_id} subscribed, {} more expected",
                state.threads_to_subscribe
            );
        }

        // A thread that exits without unsubscribing is removed when its
        // locals are dropped.
        exit_hook::arm(Arc::downgrade(&self.inner));
        if self.inner.pin_cpu {
            affinity::pin_current();
        }
        Ok(())
    }

    /// Deregister the calling thread. No-op when not subscribed.
    pub fn unsubscribe(&self) -> Result<(), GovernorError> {
        let removed = self.inner.unsubscribe_current()?;
        if removed {
            exit_hook::disarm();
            if self.inner.pin_cpu {
                affinity::unpin_current();
            }
        }
        Ok(())
    }

    /// Yield to the controller; returns when it is the caller's turn.
    /// No-op when the calling thread is not subscribed.
    pub fn control_point(&self) -> Result<(), GovernorError> {
        let native = thread::current().id();
        let token;
        {
            let mut state = self.inner.lock_state();
            if state.halted {
                return Err(state.halted_error());
            }
            let Some(thread_state) = state.registry.get_mut(native) else {
                return Ok(());
            };

            thread_state.in_control_point = true;
            token = thread_state.token;
            if let Err(err) = self.inner.decision_step(&mut state, Some(token)) {
                self.inner.halt(&mut state, &err);
                return Err(err);
            }
        }

        // The lock must be free while we wait: the other threads still
        // have to reach their own control points.
        loop {
            match self.inner.active.load(Ordering::Acquire) {
                t if t == token => return Ok(()),
                HALTED => return Err(self.inner.halted_error()),
                _ => thread::yield_now(),
            }
        }
    }

    /// Prepare the next run. Returns `true` when a run remains.
    ///
    /// Random mode discards the schedule and truncates the log. Explore
    /// mode finalizes and reloads the log, then advances the frontier;
    /// `false` means the whole schedule space has been enumerated. A
    /// stored run that never completed (no marker) is repeated
    /// unchanged — with a program under test that does not terminate,
    /// explore mode therefore never moves on. Preset mode is
    /// single-shot: once any scheduling has been consumed, this and
    /// every later reset return `false`.
    ///
    /// Consecutive resets without intervening scheduling collapse to
    /// one.
    pub fn reset(&self) -> Result<bool, GovernorError> {
        self.reset_with(false)
    }

    pub(crate) fn reset_with(&self, force: bool) -> Result<bool, GovernorError> {
        let mut state = self.inner.lock_state();
        if state.halted {
            return Err(state.halted_error());
        }

        let mode = self.inner.mode;
        let consumed = state.engine.schedule().consumed_any();

        if !force && !consumed {
            return Ok(match mode {
                RunMode::Random => true,
                RunMode::Explore => !state.explore_exhausted,
                RunMode::Preset => !state.preset_consumed,
            });
        }

        // Close out the finished run before touching the store.
        if consumed {
            self.finalize_locked(&mut state)?;
        }

        if matches!(mode, RunMode::Explore | RunMode::Preset) {
            let loaded = state.log.load();
            if let LogTail::Garbage { line } = loaded.tail {
                if mode == RunMode::Preset {
                    return Err(LogError::Corrupt { line }.into());
                }
                warn!("schedule log corrupt at line {line}; keeping the parsed prefix");
            }
            let completed = loaded.completed();
            state
                .engine
                .replace_schedule(Schedule::from_points(loaded.points, completed));
        }

        if matches!(mode, RunMode::Random | RunMode::Explore) {
            state.log.reset_for_write()?;
            state.marker_written = false;
        }

        self.inner.active.store(NO_RUNNER, Ordering::Release);

        match mode {
            RunMode::Random => {
                state.engine.schedule_mut().clear();
                Ok(true)
            }
            RunMode::Explore => {
                if !state.engine.schedule().completed() {
                    // Previous run was cut short; repeat its prefix.
                    state.engine.schedule_mut().rewind();
                    return Ok(true);
                }
                if state.engine.advance_frontier() {
                    state.explore_exhausted = false;
                    Ok(true)
                } else {
                    info!("schedule space exhausted");
                    state.explore_exhausted = true;
                    Ok(false)
                }
            }
            RunMode::Preset => {
                if consumed {
                    state.preset_consumed = true;
                }
                state.engine.schedule_mut().rewind();
                Ok(!state.preset_consumed)
            }
        }
    }

    /// Write the completion marker and flush the log.
    ///
    /// Call this when a run has finished cleanly; reset does it on its
    /// own before rewinding. A run that ends without it leaves no
    /// marker, which explore mode treats exactly like a crashed run.
    /// Writes at most once per run, so calling it and then reset is
    /// fine.
    pub fn finalize(&self) -> Result<(), GovernorError> {
        let mut state = self.inner.lock_state();
        self.finalize_locked(&mut state)
    }

    fn finalize_locked(&self, state: &mut State) -> Result<(), GovernorError> {
        if matches!(self.inner.mode, RunMode::Random | RunMode::Explore) && !state.marker_written
        {
            state.log.finalize()?;
            state.marker_written = true;
        }
        Ok(())
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        // A panic under the lock cannot leave the state half-updated in
        // a way later calls would misread; keep the guard usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn halt(&self, state: &mut State, err: &GovernorError) {
        error!("governor halted: {err}");
        state.halted = true;
        state.halt_reason = Some(err.to_string());
        self.active.store(HALTED, Ordering::Release);
    }

    /// The halt as an error, for threads that only saw the sentinel.
    fn halted_error(&self) -> GovernorError {
        self.lock_state().halted_error()
    }

    /// Remove the calling thread and re-run the decision step: the
    /// candidate set shrank, so a new runner may need choosing.
    pub(crate) fn unsubscribe_current(&self) -> Result<bool, GovernorError> {
        let native = thread::current().id();
        let mut state = self.lock_state();
        let Some(removed) = state.registry.remove(native) else {
            return Ok(false);
        };
        debug!("thread {} unsubscribed", removed.thread_id);

        match self.decision_step(&mut state, Some(removed.token)) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.halt(&mut state, &err);
                Err(err)
            }
        }
    }

    /// Decide whether a new runner can be unparked, and publish it.
    fn decision_step(
        &self,
        state: &mut State,
        caller_token: Option<u64>,
    ) -> Result<(), GovernorError> {
        // The caller gives its slot back before a new runner is chosen.
        if let Some(token) = caller_token {
            if self.active.load(Ordering::Acquire) == token {
                self.active.store(NO_RUNNER, Ordering::Release);
            }
        }

        if state.threads_to_subscribe > 0 {
            return Ok(()); // not every participant has arrived
        }
        if state.registry.any_running() {
            return Ok(()); // someone is still executing user code
        }
        if state.registry.is_empty() {
            return Ok(()); // last thread just left
        }

        let State {
            registry,
            engine,
            log,
            ..
        } = state;
        let thread_id = engine.choose(registry, log)?;
        let record = engine.schedule().cursor();

        let native = registry.native_for(thread_id);
        let Some(chosen) = native.and_then(|native| registry.get_mut(native)) else {
            return Err(ScheduleError::UnknownThread {
                line: record,
                thread_id,
            }
            .into());
        };

        chosen.in_control_point = false;
        let token = chosen.token;
        debug!("thread {thread_id} unparked");
        self.active.store(token, Ordering::Release);
        Ok(())
    }
}
