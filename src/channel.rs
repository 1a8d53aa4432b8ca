// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Establishes the RabbitMQ connection and channel the receiver consumes from,
//! and exposes them as a [`BrokerSession`]. The queue is declared durable and
//! consumed with manual acknowledgments.

use crate::{
    configs::RabbitMQConfigs,
    delivery::{Delivery, DeliveryTag},
    errors::{AckError, AmqpError, SessionError},
    session::BrokerSession,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions},
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties, Consumer,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, PoisonError,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reply code sent when the receiver closes its channel.
const REPLY_SUCCESS: u16 = 200;

/// Creates a new AMQP connection and channel.
///
/// Gives up with [`AmqpError::ConnectionError`] once the configured
/// connection timeout elapses.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match tokio::time::timeout(
        cfg.connection_timeout(),
        Connection::connect(&cfg.amqp_uri(), options),
    )
    .await
    {
        Ok(Ok(c)) => Ok(c),
        Ok(Err(err)) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
        Err(_) => {
            error!(timeout = ?cfg.connection_timeout(), "timeout while connecting");
            Err(AmqpError::ConnectionError)
        }
    }?;
    info!(host = %cfg.host, queue = %cfg.queue, "amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// Whether a session can still be used.
///
/// Closed by the receiver through [`BrokerSession::close`], or broken when the
/// connection reports an error.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    closed: AtomicBool,
    broken: std::sync::Mutex<Option<String>>,
}

impl SessionState {
    /// Records that the connection became unusable. The first reason wins.
    pub(crate) fn mark_broken(&self, reason: String) {
        let mut broken = self.broken.lock().unwrap_or_else(PoisonError::into_inner);
        if broken.is_none() {
            *broken = Some(reason);
        }
    }

    /// Marks the session closed.
    ///
    /// # Returns
    /// `true` when it was already closed
    pub(crate) fn close(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_usable(&self) -> bool {
        self.check().is_ok()
    }

    /// Fails with a terminal error once the session is closed or broken.
    pub(crate) fn check(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed("session closed".to_owned()));
        }

        match self
            .broken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(reason) => Err(SessionError::Closed(reason.clone())),
            None => Ok(()),
        }
    }
}

/// [`BrokerSession`] backed by a lapin consumer.
pub struct LapinSession {
    queue: String,
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    consumer: Mutex<Consumer>,
    state: Arc<SessionState>,
}

impl LapinSession {
    /// Connects, declares the queue and starts consuming it.
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<LapinSession, AmqpError> {
        let (connection, channel) = new_amqp_channel(cfg).await?;
        LapinSession::open(&cfg.queue, cfg.prefetch, connection, channel).await
    }

    /// Starts consuming `queue` on an already opened channel.
    ///
    /// Also registers a connection error hook: once the connection fails, the
    /// session reports itself dead and the next fetch fails right away.
    ///
    /// # Parameters
    /// * `queue` - The queue to declare and consume
    /// * `prefetch` - Optional per-consumer prefetch count
    /// * `connection` - The connection `channel` belongs to
    /// * `channel` - An open channel
    ///
    /// # Returns
    /// The session, or the [`AmqpError`] of the first failing declaration
    pub async fn open(
        queue: &str,
        prefetch: Option<u16>,
        connection: Arc<Connection>,
        channel: Arc<Channel>,
    ) -> Result<LapinSession, AmqpError> {
        if let Err(err) = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            error!(error = err.to_string(), queue, "failure to declare the queue");
            return Err(AmqpError::DeclareQueueError(queue.to_owned()));
        }

        if let Some(count) = prefetch {
            if let Err(err) = channel
                .basic_qos(count, BasicQosOptions { global: false })
                .await
            {
                error!(error = err.to_string(), queue, "failure to configure qos");
                return Err(AmqpError::QoSDeclarationError(queue.to_owned()));
            }
        }

        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let consumer = match channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;
        debug!(queue, consumer_tag = %consumer_tag, "consumer created");

        let state = Arc::new(SessionState::default());
        connection.on_error({
            let state = state.clone();
            let queue = queue.to_owned();
            move |err| {
                warn!(queue = %queue, error = err.to_string(), "shutdown of rabbitmq connection detected");
                state.mark_broken(err.to_string());
            }
        });

        Ok(LapinSession {
            queue: queue.to_owned(),
            connection,
            channel,
            consumer: Mutex::new(consumer),
            state,
        })
    }

    /// The consumed queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The underlying channel, e.g. to declare more topology on it.
    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }
}

#[async_trait]
impl BrokerSession for LapinSession {
    async fn next_delivery(&self) -> Result<Delivery, SessionError> {
        self.state.check()?;

        let mut consumer = self.consumer.lock().await;
        match consumer.next().await {
            Some(Ok(delivery)) => Ok(Delivery::from(delivery)),
            Some(Err(err)) if self.is_alive() => Err(SessionError::FetchError(err.to_string())),
            Some(Err(err)) => Err(SessionError::Closed(err.to_string())),
            None => Err(SessionError::Closed("consumer stream ended".to_owned())),
        }
    }

    async fn acknowledge(&self, tag: DeliveryTag) -> Result<(), AckError> {
        self.channel
            .basic_ack(tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AckError::AckMessageError {
                tag,
                reason: err.to_string(),
            })
    }

    fn is_alive(&self) -> bool {
        self.state.is_usable()
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.state.close() {
            return Ok(());
        }

        debug!(queue = %self.queue, "closing channel");
        self.channel
            .close(REPLY_SUCCESS, "receiver closed")
            .await
            .map_err(|err| SessionError::Closed(err.to_string()))
    }
}
