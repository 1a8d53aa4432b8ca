// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Processes a single delivery end to end:
//! 1. Opens a consumer span from the propagated trace context
//! 2. Offers the delivery to every handler of a registry snapshot
//! 3. Aggregates the per-handler outcomes
//! 4. Decides between acknowledging and leaving the delivery for a retry
//! 5. Acknowledges when the decision is terminal

use crate::{
    delivery::{Delivery, DeliveryTag},
    dispatcher::DispatchContext,
    errors::HandlerError,
    handler::Handler,
    ledger::RetryLedger,
    otel,
};
use futures_util::{future::join_all, FutureExt};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Status, TraceContextExt},
    Context,
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Why a delivery is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReason {
    /// Every handler succeeded.
    Success,
    /// At least one handler failed and the receiver does not retry.
    RetryDisabled,
    /// The delivery failed for the second time.
    RetriesExhausted,
}

/// Outcome of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Acknowledge the tag; the delivery is done for good.
    Ack(AckReason),
    /// Leave the delivery unacknowledged so the broker presents it again.
    Retry,
}

/// Picks the acknowledgment outcome of a delivery once all handlers ran.
///
/// Terminal outcomes evict the tag from the ledger.
pub(crate) fn decide(
    failed: bool,
    allow_retry: bool,
    ledger: &mut RetryLedger,
    tag: DeliveryTag,
) -> AckDecision {
    if !failed {
        ledger.evict(tag);
        return AckDecision::Ack(AckReason::Success);
    }

    if !allow_retry {
        ledger.evict(tag);
        return AckDecision::Ack(AckReason::RetryDisabled);
    }

    if ledger.record_failure(tag) {
        AckDecision::Retry
    } else {
        ledger.evict(tag);
        AckDecision::Ack(AckReason::RetriesExhausted)
    }
}

/// Runs every registered handler for `delivery` and settles its acknowledgment.
///
/// Handler failures, panics and timeouts are contained here; an acknowledgment
/// failure is logged and left to the broker redelivery semantics.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    ctx: &DispatchContext,
) -> AckDecision {
    let (parent, span) = otel::delivery_span(delivery, tracer, &ctx.queue);
    let cx = parent.with_span(span);
    let span = cx.span();

    debug!(
        tag = delivery.tag,
        size = delivery.body.len(),
        exchange = %delivery.metadata.exchange,
        "received message"
    );

    let listeners = ctx.registry.snapshot();
    let outcomes = if ctx.concurrent_handlers {
        join_all(
            listeners
                .iter()
                .map(|listener| invoke(listener, &cx, delivery, ctx.handler_timeout)),
        )
        .await
    } else {
        let mut outcomes = Vec::with_capacity(listeners.len());
        for listener in listeners.iter() {
            outcomes.push(invoke(listener, &cx, delivery, ctx.handler_timeout).await);
        }
        outcomes
    };

    let mut failed = false;
    for err in outcomes.iter().filter_map(|outcome| outcome.as_ref().err()) {
        failed = true;
        warn!(tag = delivery.tag, error = err.to_string(), "error while executing the listener");
        span.record_error(err);
    }

    let decision = {
        let mut ledger = ctx.ledger();
        decide(failed, ctx.allow_retry, &mut ledger, delivery.tag)
    };

    match decision {
        AckDecision::Retry => {
            debug!(tag = delivery.tag, "processing of listener has failed, but retry is allowed");
            span.set_status(Status::Error {
                description: Cow::from("listener failed, waiting for redelivery"),
            });
        }
        AckDecision::Ack(reason) => {
            if reason != AckReason::Success {
                warn!(tag = delivery.tag, reason = ?reason, "processing of listener has failed");
                span.set_status(Status::Error {
                    description: Cow::from("listener failed, message removed from queue"),
                });
            }

            debug!(tag = delivery.tag, "sending ack");
            match ctx.session.acknowledge(delivery.tag).await {
                Err(e) => {
                    warn!(tag = delivery.tag, error = e.to_string(), "cannot ack message");
                    span.record_error(&e);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                }
                Ok(_) if reason == AckReason::Success => span.set_status(Status::Ok),
                Ok(_) => {}
            }
        }
    }

    decision
}

async fn invoke(
    listener: &Arc<dyn Handler>,
    cx: &Context,
    delivery: &Delivery,
    timeout: Option<Duration>,
) -> Result<(), HandlerError> {
    let call = AssertUnwindSafe(listener.on_delivery(cx, delivery)).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(HandlerError::Timeout(limit)),
        },
        None => call.await,
    };

    outcome.unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic))))
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
