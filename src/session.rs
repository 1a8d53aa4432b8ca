// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Session
//!
//! The narrow view of a broker connection the receiver works against: fetch the
//! next delivery, acknowledge a tag and report liveness. Connection setup,
//! recovery and TLS live behind this trait. [`crate::channel::LapinSession`] is
//! the RabbitMQ implementation.

use crate::{
    delivery::{Delivery, DeliveryTag},
    errors::{AckError, SessionError},
};
use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Waits for the next delivery of the bound queue.
    async fn next_delivery(&self) -> Result<Delivery, SessionError>;

    /// Acknowledges a single delivery.
    async fn acknowledge(&self, tag: DeliveryTag) -> Result<(), AckError>;

    /// Non-blocking liveness check.
    fn is_alive(&self) -> bool;

    /// Closes the session. A pending `next_delivery` must return a terminal error.
    async fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }
}
