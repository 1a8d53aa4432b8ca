// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Receiver
//!
//! Every failure the receiver can run into is contained inside the engine.
//! Nothing here reaches the caller of `register`: connection setup returns
//! [`AmqpError`], everything after that is either reported to the handlers
//! through `on_receive_error` or logged.

use crate::delivery::DeliveryTag;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while establishing the broker connection, channel and consumer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// The `host/vhost` shorthand could not be parsed
    #[error("invalid definition of host/virtualhost `{0}`")]
    InvalidHost(String),
}

/// Errors produced by the broker session while fetching the next delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Transient trouble, the session may still yield deliveries later.
    #[error("failure to receive message `{0}`")]
    FetchError(String),

    /// The session is permanently unusable.
    #[error("session closed `{0}`")]
    Closed(String),
}

impl SessionError {
    /// Whether the dispatch loop must stop after this error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::Closed(_))
    }
}

/// Acknowledgment failure. Logged and never retried by the receiver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("failure to ack message `{tag}`: {reason}")]
    AckMessageError { tag: DeliveryTag, reason: String },
}

/// Failure of a single handler for a single delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

/// The reason a dispatch loop execution ended.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopCrash {
    #[error("dispatch loop stopped, session closed: {0}")]
    SessionClosed(SessionError),

    #[error("dispatch loop panicked: {0}")]
    Panicked(String),

    #[error("dispatch loop aborted")]
    Aborted,
}
