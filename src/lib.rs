// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod dispatcher;
mod otel;

pub mod channel;
pub mod configs;
pub mod delivery;
pub mod errors;
pub mod handler;
pub mod ledger;
pub mod receiver;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use consumer::{AckDecision, AckReason};
pub use receiver::RabbitMQReceiver;
