// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Deliveries
//!
//! A [`Delivery`] is one message instance handed out by the broker session.
//! It is owned by the dispatch loop for a single processing pass and dropped
//! once the acknowledgment decision has been made.

use lapin::protocol::basic::AMQPProperties;

/// Broker assigned identifier used to correlate a delivery with its acknowledgment.
pub type DeliveryTag = u64;

/// Envelope fields supplied by the broker, passed through untouched.
#[derive(Debug, Clone, Default)]
pub struct DeliveryMetadata {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: AMQPProperties,
}

/// One inbound message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    pub metadata: DeliveryMetadata,
}

impl Delivery {
    /// Creates a delivery with empty metadata.
    pub fn new(tag: DeliveryTag, body: impl Into<Vec<u8>>) -> Self {
        Delivery {
            tag,
            body: body.into(),
            metadata: DeliveryMetadata::default(),
        }
    }

    /// Sets the envelope fields.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn metadata(mut self, metadata: DeliveryMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// The `type` property of the message, or an empty string.
    pub fn kind(&self) -> String {
        match self.metadata.properties.kind() {
            Some(value) => value.to_string(),
            _ => "".to_owned(),
        }
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            tag: delivery.delivery_tag,
            body: delivery.data,
            metadata: DeliveryMetadata {
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
                properties: delivery.properties,
            },
        }
    }
}
