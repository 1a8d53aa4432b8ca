// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Receiver Configuration
//!
//! [`RabbitMQConfigs`] describes how to reach the broker and which queue to
//! consume. It derives `Deserialize` so it can be loaded from any serde source.
//! [`ReceiverConfigs`] tunes the engine itself: retry policy, supervisor
//! period, handler timeout and the runtime the engine spawns its tasks on.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::time::Duration;
use tokio::runtime::Handle;

/// Default delay between two supervisor liveness checks.
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(1);
/// Default connection timeout in milliseconds.
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5000;

/// Broker connection parameters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub queue: String,
    pub connection_name: String,
    pub prefetch: Option<u16>,
    pub connection_timeout_ms: u64,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
            queue: "".to_owned(),
            connection_name: "rabbitmq-receiver".to_owned(),
            prefetch: None,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
        }
    }
}

impl RabbitMQConfigs {
    /// Creates a configuration consuming `queue` with default connection settings.
    pub fn new(queue: &str) -> Self {
        RabbitMQConfigs {
            queue: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the host. Accepts the `host/vhost` shorthand.
    ///
    /// # Errors
    /// [`AmqpError::InvalidHost`] when there is more than one `/` or either
    /// side of it is blank.
    pub fn with_host(mut self, host: &str) -> Result<Self, AmqpError> {
        if !host.contains('/') {
            self.host = host.to_owned();
            return Ok(self);
        }

        let parts: Vec<&str> = host.split('/').collect();
        if parts.len() > 2 || parts[0].trim().is_empty() || parts[1].trim().is_empty() {
            return Err(AmqpError::InvalidHost(host.to_owned()));
        }

        self.host = parts[0].to_owned();
        self.vhost = parts[1].to_owned();
        Ok(self)
    }

    /// Sets the credentials. Blank values keep the defaults.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        if !user.trim().is_empty() {
            self.user = user.to_owned();
        }
        if !password.trim().is_empty() {
            self.password = password.to_owned();
        }
        self
    }

    /// Sets the per-consumer prefetch count.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    /// Connection timeout, falling back to the default when unset.
    pub fn connection_timeout(&self) -> Duration {
        match self.connection_timeout_ms {
            0 => Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            ms => Duration::from_millis(ms),
        }
    }

    /// The AMQP URI for this configuration.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct ReceiverConfigs {
    pub(crate) allow_retry: bool,
    pub(crate) check_period: Duration,
    pub(crate) handler_timeout: Option<Duration>,
    pub(crate) concurrent_handlers: bool,
    pub(crate) runtime: Option<Handle>,
}

impl Default for ReceiverConfigs {
    fn default() -> Self {
        ReceiverConfigs {
            allow_retry: true,
            check_period: DEFAULT_CHECK_PERIOD,
            handler_timeout: None,
            concurrent_handlers: true,
            runtime: None,
        }
    }
}

impl ReceiverConfigs {
    /// Enables or disables the single retry of failed deliveries.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn allow_retry(mut self, allow: bool) -> Self {
        self.allow_retry = allow;
        self
    }

    /// Sets the period of the supervisor liveness check. Zero is ignored.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn check_period(mut self, period: Duration) -> Self {
        if !period.is_zero() {
            self.check_period = period;
        }
        self
    }

    /// Bounds the time a single handler may spend on one delivery.
    /// A handler exceeding it counts as failed.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Runs the handlers of one delivery one after another instead of concurrently.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn sequential_handlers(mut self) -> Self {
        self.concurrent_handlers = false;
        self
    }

    /// Spawns the engine tasks on the given runtime instead of the current one.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn is_retry_allowed(&self) -> bool {
        self.allow_retry
    }
}
