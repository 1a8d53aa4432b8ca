// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Loop
//!
//! The long-lived flow pulling deliveries from the broker session and handing
//! each one to [`consume`]. Exactly one delivery is in flight per loop, so the
//! handlers, the retry decision and the acknowledgment of a tag never overlap
//! with another delivery.
//!
//! A fetch error is reported to every handler through `on_receive_error` and
//! the loop keeps going. Only a terminal session error ends it; restarting it
//! is the supervisor's job.

use crate::{
    configs::ReceiverConfigs,
    consumer::{consume, panic_message},
    errors::{LoopCrash, SessionError},
    handler::Handler,
    ledger::RetryLedger,
    registry::ListenerRegistry,
    session::BrokerSession,
};
use futures_util::FutureExt;
use opentelemetry::global;
use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Everything a dispatch loop execution needs. Cloned into every new loop, so
/// the retry ledger survives restarts.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub(crate) queue: String,
    pub(crate) session: Arc<dyn BrokerSession>,
    pub(crate) registry: Arc<ListenerRegistry>,
    pub(crate) ledger: Arc<Mutex<RetryLedger>>,
    pub(crate) allow_retry: bool,
    pub(crate) handler_timeout: Option<Duration>,
    pub(crate) concurrent_handlers: bool,
}

impl DispatchContext {
    pub(crate) fn new(
        queue: &str,
        session: Arc<dyn BrokerSession>,
        registry: Arc<ListenerRegistry>,
        allow_retry: bool,
    ) -> Self {
        DispatchContext {
            queue: queue.to_owned(),
            session,
            registry,
            ledger: Arc::new(Mutex::new(RetryLedger::new())),
            allow_retry,
            handler_timeout: None,
            concurrent_handlers: true,
        }
    }

    pub(crate) fn from_configs(
        queue: &str,
        session: Arc<dyn BrokerSession>,
        registry: Arc<ListenerRegistry>,
        cfg: &ReceiverConfigs,
    ) -> Self {
        let mut ctx = Self::new(queue, session, registry, cfg.allow_retry);
        ctx.handler_timeout = cfg.handler_timeout;
        ctx.concurrent_handlers = cfg.concurrent_handlers;
        ctx
    }

    #[cfg(test)]
    pub(crate) fn sequential(mut self) -> Self {
        self.concurrent_handlers = false;
        self
    }

    #[cfg(test)]
    pub(crate) fn timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub(crate) fn ledger(&self) -> MutexGuard<'_, RetryLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs the dispatch loop until the session reports itself closed.
pub(crate) async fn run_loop(ctx: DispatchContext) -> LoopCrash {
    let tracer = global::tracer("amqp consumer");
    info!(queue = %ctx.queue, "dispatch loop started");

    loop {
        debug!("waiting for message");

        match ctx.session.next_delivery().await {
            Ok(delivery) => {
                consume(&tracer, &delivery, &ctx).await;
            }
            Err(err) => {
                debug!(error = err.to_string(), "error while receiving new message");
                notify_receive_error(&ctx.registry.snapshot(), &err).await;

                if err.is_terminal() {
                    return LoopCrash::SessionClosed(err);
                }
            }
        }
    }
}

async fn notify_receive_error(listeners: &[Arc<dyn Handler>], err: &SessionError) {
    for listener in listeners {
        if let Err(panic) = AssertUnwindSafe(listener.on_receive_error(err))
            .catch_unwind()
            .await
        {
            warn!(
                error = panic_message(panic),
                "listener panicked while handling a receive error"
            );
        }
    }
}
