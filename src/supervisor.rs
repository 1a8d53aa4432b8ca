// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Loop Supervisor
//!
//! Keeps exactly one dispatch loop alive once a listener has been registered.
//!
//! ```text
//! interval(check_period) ──► ensure_running()
//!                               │  (restart lock: one (re)start attempt at a time)
//!                               ├─ loop alive?          → nothing to do
//!                               ├─ loop ended?          → log why, forget it
//!                               ├─ await_activation()   (blocks until first register)
//!                               └─ spawn run_loop()     → keep the JoinHandle
//! ```
//!
//! The `JoinHandle` itself is guarded by a separate, never-awaited lock, so
//! `is_loop_running` and `abort_loop` (used from `Drop`) see the live loop even
//! while a restart is waiting for listeners.
//!
//! Liveness is polled, so a dead loop is noticed within one check period.

use crate::{
    consumer::panic_message,
    dispatcher::{run_loop, DispatchContext},
    errors::LoopCrash,
};
use futures_util::FutureExt;
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::Mutex,
    task::{JoinError, JoinHandle},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, info_span, Instrument};

/// Owner of the dispatch loop of one receiver.
///
/// `restart` serializes (re)start attempts, which may wait for the first
/// listener. The live loop handle sits behind a plain mutex that is never held
/// across an await, so liveness checks and aborts never wait for a restart.
pub struct LoopSupervisor {
    ctx: DispatchContext,
    runtime: Handle,
    check_period: Duration,
    restart: Mutex<()>,
    current: std::sync::Mutex<Option<JoinHandle<LoopCrash>>>,
    last_crash: std::sync::Mutex<Option<LoopCrash>>,
    starts: AtomicUsize,
    stopped: AtomicBool,
}

impl LoopSupervisor {
    /// Creates a supervisor for the loop described by `ctx`.
    ///
    /// # Parameters
    /// * `ctx` - What every dispatch loop execution runs with
    /// * `runtime` - Runtime the dispatch loops are spawned on
    /// * `check_period` - Delay between two liveness checks in [`LoopSupervisor::run`]
    pub(crate) fn new(ctx: DispatchContext, runtime: Handle, check_period: Duration) -> Self {
        LoopSupervisor {
            ctx,
            runtime,
            check_period,
            restart: Mutex::new(()),
            current: std::sync::Mutex::new(None),
            last_crash: std::sync::Mutex::new(None),
            starts: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Whether a dispatch loop is currently running.
    pub fn is_loop_running(&self) -> bool {
        self.current()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// How many dispatch loops have been started so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Why the previous dispatch loop ended, if one did.
    pub fn last_crash(&self) -> Option<LoopCrash> {
        self.last_crash
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts a dispatch loop unless one is alive.
    ///
    /// Waits for the first listener before starting. Concurrent calls are
    /// serialized, and a call finding a live loop returns without starting one.
    /// Once the supervisor is stopped no loop is started anymore.
    ///
    /// # Returns
    /// `true` when a new loop was started
    pub(crate) async fn ensure_running(&self) -> bool {
        let _restart = self.restart.lock().await;

        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }

        let finished = {
            let mut current = self.current();
            if current.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return false;
            }
            current.take()
        };
        if let Some(handle) = finished {
            self.record_exit(handle.await);
        }

        debug!(queue = %self.ctx.queue, "waiting for listeners");
        self.ctx.registry.await_activation().await;

        let started = {
            let mut current = self.current();
            // stopped while waiting for listeners
            if self.stopped.load(Ordering::SeqCst) {
                return false;
            }
            let started = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
            let span = info_span!("mqlistener", queue = %self.ctx.queue, run = started);
            *current = Some(
                self.runtime
                    .spawn(run_loop(self.ctx.clone()).instrument(span)),
            );
            started
        };

        info!(queue = %self.ctx.queue, run = started, "dispatch loop spawned");
        true
    }

    /// Ticks forever, (re)starting the dispatch loop whenever it is not alive.
    pub(crate) async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.check_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Err(panic) = AssertUnwindSafe(self.ensure_running())
                .catch_unwind()
                .await
            {
                error!(
                    error = panic_message(panic),
                    "failure to start the dispatch loop"
                );
            }
        }
    }

    /// Stops the supervisor and waits for the running dispatch loop to end.
    pub(crate) async fn stop_loop(&self) {
        let handle = self.stop();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Stops the supervisor and aborts the running dispatch loop without waiting.
    pub(crate) fn abort_loop(&self) {
        self.stop();
    }

    fn stop(&self) -> Option<JoinHandle<LoopCrash>> {
        let mut current = self.current();
        self.stopped.store(true, Ordering::SeqCst);
        let handle = current.take();
        if let Some(handle) = &handle {
            handle.abort();
        }
        handle
    }

    fn current(&self) -> MutexGuard<'_, Option<JoinHandle<LoopCrash>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_exit(&self, exit: Result<LoopCrash, JoinError>) {
        let crash = match exit {
            Ok(crash) => crash,
            Err(err) if err.is_panic() => LoopCrash::Panicked(panic_message(err.into_panic())),
            Err(_) => LoopCrash::Aborted,
        };

        error!(
            queue = %self.ctx.queue,
            error = crash.to_string(),
            "dispatch loop terminated, restarting"
        );
        *self
            .last_crash
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(crash);
    }
}
