// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handlers
//!
//! Applications receive messages by registering a [`Handler`] on the receiver.
//! Each delivery is offered to every registered handler; a handler reports its
//! own outcome through the returned `Result` and never affects the others.
//!
//! Handlers receive the OpenTelemetry [`Context`] of the delivery. It carries
//! the consumer span, itself parented to the trace context propagated in the
//! message headers, so handlers can open child spans or record events on it.

use crate::{
    delivery::Delivery,
    errors::{HandlerError, SessionError},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use opentelemetry::Context;
use std::sync::Arc;

/// Application callback invoked by the dispatch loop.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes a single delivery. An `Err` marks the delivery as failed for
    /// the retry/acknowledgment decision.
    ///
    /// # Parameters
    /// * `ctx` - Trace context holding the consumer span of this delivery
    /// * `delivery` - The received message
    async fn on_delivery(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;

    /// Called when the session fails to produce the next delivery.
    async fn on_receive_error(&self, _error: &SessionError) {}
}

type DeliveryFn = dyn Fn(Delivery) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;

/// A [`Handler`] built from an async closure.
///
/// The closure only gets the delivery. Implement [`Handler`] directly to use
/// the trace context.
///
/// # Example
/// ```
/// use rabbitmq_receiver::handler::HandlerFn;
///
/// let handler = HandlerFn::arc(|delivery| async move {
///     println!("received {} bytes", delivery.body.len());
///     Ok(())
/// });
/// ```
pub struct HandlerFn {
    f: Box<DeliveryFn>,
}

impl HandlerFn {
    /// Wraps `f` into a handler.
    ///
    /// # Parameters
    /// * `f` - Called with an owned copy of every delivery; its future settles
    ///   the outcome of this handler
    ///
    /// # Returns
    /// A handler that is not registered yet
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        HandlerFn {
            f: Box::new(
                move |delivery: Delivery| -> BoxFuture<'static, Result<(), HandlerError>> {
                    Box::pin(f(delivery))
                },
            ),
        }
    }

    /// Same as [`HandlerFn::new`], ready to be registered.
    pub fn arc<F, Fut>(f: F) -> Arc<HandlerFn>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Arc::new(HandlerFn::new(f))
    }
}

#[async_trait]
impl Handler for HandlerFn {
    async fn on_delivery(
        &self,
        _ctx: &Context,
        delivery: &Delivery,
    ) -> Result<(), HandlerError> {
        (self.f)(delivery.clone()).await
    }
}
