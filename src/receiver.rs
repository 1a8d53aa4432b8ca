// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Receiver
//!
//! The receiver waits for its first listener, then consumes its queue and
//! delivers every message to all registered listeners. A delivery is
//! acknowledged once all listeners have processed it; a failed delivery is
//! left for the broker to redeliver once (when retry is allowed) and
//! acknowledged on its second failure.
//!
//! The receiver owns its tasks: a supervisor ticking on the configured period
//! and at most one dispatch loop, both spawned on the runtime given in
//! [`ReceiverConfigs`] (or the current one).

use crate::{
    channel::LapinSession,
    configs::{RabbitMQConfigs, ReceiverConfigs},
    dispatcher::DispatchContext,
    errors::{AmqpError, LoopCrash, SessionError},
    handler::Handler,
    registry::ListenerRegistry,
    session::BrokerSession,
    supervisor::LoopSupervisor,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Receiver of one RabbitMQ queue.
///
/// Deliveries are offered to every registered [`Handler`] once the first one is
/// registered. A dispatch loop that dies is restarted by the supervisor within
/// one check period.
pub struct RabbitMQReceiver {
    queue: String,
    allow_retry: bool,
    session: Arc<dyn BrokerSession>,
    registry: Arc<ListenerRegistry>,
    supervisor: Arc<LoopSupervisor>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RabbitMQReceiver {
    /// Creates a receiver consuming `queue` through `session`.
    ///
    /// The supervisor starts ticking right away, but nothing is fetched from
    /// the session before the first listener is registered.
    ///
    /// # Parameters
    /// * `queue` - Name of the consumed queue, used for logs and span names
    /// * `session` - Broker session yielding the deliveries
    /// * `cfg` - Retry policy, check period, handler options and runtime
    ///
    /// # Errors
    /// [`AmqpError::InternalError`] when no runtime was configured and the
    /// call is made outside of a tokio runtime.
    pub fn new(
        queue: &str,
        session: Arc<dyn BrokerSession>,
        cfg: ReceiverConfigs,
    ) -> Result<RabbitMQReceiver, AmqpError> {
        let runtime = match cfg.runtime.clone() {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|err| {
                error!(error = err.to_string(), "no runtime to spawn the receiver on");
                AmqpError::InternalError
            })?,
        };

        let registry = Arc::new(ListenerRegistry::new());
        let ctx = DispatchContext::from_configs(queue, session.clone(), registry.clone(), &cfg);
        let supervisor = Arc::new(LoopSupervisor::new(ctx, runtime.clone(), cfg.check_period));
        let ticker = runtime.spawn(supervisor.clone().run());

        info!(queue, allow_retry = cfg.allow_retry, "receiver created, waiting for listeners");

        Ok(RabbitMQReceiver {
            queue: queue.to_owned(),
            allow_retry: cfg.allow_retry,
            session,
            registry,
            supervisor,
            ticker: Mutex::new(Some(ticker)),
            closed: AtomicBool::new(false),
        })
    }

    /// Connects to RabbitMQ and creates a receiver for `amqp.queue`.
    ///
    /// # Errors
    /// Any [`AmqpError`] raised while opening the connection, the channel and
    /// the consumer, or by [`RabbitMQReceiver::new`].
    pub async fn connect(
        amqp: &RabbitMQConfigs,
        cfg: ReceiverConfigs,
    ) -> Result<RabbitMQReceiver, AmqpError> {
        info!(host = %amqp.host, queue = %amqp.queue, "connecting to rabbitmq");
        let session = LapinSession::connect(amqp).await?;
        RabbitMQReceiver::new(&amqp.queue, Arc::new(session), cfg)
    }

    /// Registers a listener. Registering the same instance again has no effect.
    /// The first registration lets the receiver start consuming.
    pub fn register(&self, handler: Arc<dyn Handler>) {
        if !self.registry.register(handler) {
            debug!(queue = %self.queue, "listener already registered");
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_retry_allowed(&self) -> bool {
        self.allow_retry
    }

    pub fn listeners(&self) -> usize {
        self.registry.len()
    }

    /// Whether a dispatch loop is consuming right now.
    pub fn is_consuming(&self) -> bool {
        self.supervisor.is_loop_running()
    }

    /// How many dispatch loops were started, restarts included.
    pub fn loop_starts(&self) -> usize {
        self.supervisor.starts()
    }

    /// Why the last dispatch loop ended, if one did.
    pub fn last_crash(&self) -> Option<LoopCrash> {
        self.supervisor.last_crash()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        !self.is_closed() && self.session.is_alive()
    }

    /// Stops the supervisor, closes the session and waits for the dispatch
    /// loop to stop. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            ticker.abort();
            let _ = ticker.await;
        }

        let closing = self.session.close().await;
        if let Err(err) = &closing {
            warn!(queue = %self.queue, error = err.to_string(), "error while closing the receiver");
        }

        self.supervisor.stop_loop().await;
        info!(queue = %self.queue, "receiver closed");

        closing
    }
}

impl Drop for RabbitMQReceiver {
    fn drop(&mut self) {
        if let Some(ticker) = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            ticker.abort();
        }
        self.supervisor.abort_loop();
    }
}
