// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use opentelemetry::Context;
use rabbitmq_receiver::{
    configs::ReceiverConfigs,
    delivery::{Delivery, DeliveryTag},
    errors::{AckError, HandlerError, LoopCrash, SessionError},
    handler::{Handler, HandlerFn},
    session::BrokerSession,
    RabbitMQReceiver,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};

/// Broker session fed through a channel, recording every acknowledgment.
struct InMemorySession {
    deliveries: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Delivery, SessionError>>>,
    acks: Mutex<Vec<DeliveryTag>>,
    fetches: AtomicUsize,
    closed: watch::Sender<bool>,
}

impl InMemorySession {
    fn new() -> (Arc<InMemorySession>, mpsc::UnboundedSender<Result<Delivery, SessionError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let session = InMemorySession {
            deliveries: tokio::sync::Mutex::new(rx),
            acks: Mutex::new(vec![]),
            fetches: AtomicUsize::new(0),
            closed,
        };
        (Arc::new(session), tx)
    }

    fn acks(&self) -> Vec<DeliveryTag> {
        self.acks.lock().unwrap().clone()
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn next_delivery(&self) -> Result<Delivery, SessionError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut closed = self.closed.subscribe();
        let mut deliveries = self.deliveries.lock().await;

        tokio::select! {
            next = deliveries.recv() => match next {
                Some(next) => next,
                None => Err(SessionError::Closed("no more deliveries".into())),
            },
            _ = closed.wait_for(|closed| *closed) => Err(SessionError::Closed("session closed".into())),
        }
    }

    async fn acknowledge(&self, tag: DeliveryTag) -> Result<(), AckError> {
        self.acks.lock().unwrap().push(tag);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

/// Handler counting its calls, failing while `fail` says so.
struct Counting {
    calls: AtomicUsize,
    fail: bool,
}

impl Counting {
    fn new(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for Counting {
    async fn on_delivery(
        &self,
        _ctx: &Context,
        _delivery: &Delivery,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(HandlerError::failed("rejected"));
        }
        Ok(())
    }
}

async fn ticks(n: u64) {
    tokio::time::sleep(Duration::from_millis(1000 * n + 100)).await;
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_is_retried_once_then_acked() {
    let (session, tx) = InMemorySession::new();
    let receiver =
        RabbitMQReceiver::new("jobs", session.clone(), ReceiverConfigs::default()).unwrap();

    tx.send(Ok(Delivery::new(42, "payload"))).unwrap();
    ticks(5).await;

    assert_eq!(session.fetches(), 0);
    assert!(!receiver.is_consuming());
    assert_eq!(receiver.loop_starts(), 0);

    let handler = Counting::new(true);
    receiver.register(handler.clone());
    ticks(1).await;

    assert!(receiver.is_consuming());
    assert_eq!(handler.calls(), 1);
    assert!(session.acks().is_empty());

    tx.send(Ok(Delivery::new(42, "payload"))).unwrap();
    ticks(1).await;

    assert_eq!(handler.calls(), 2);
    assert_eq!(session.acks(), vec![42]);

    receiver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retry_disabled_acks_every_failure() {
    let (session, tx) = InMemorySession::new();
    let receiver = RabbitMQReceiver::new(
        "jobs",
        session.clone(),
        ReceiverConfigs::default().allow_retry(false),
    )
    .unwrap();
    assert!(!receiver.is_retry_allowed());

    receiver.register(Counting::new(true));
    for tag in [1, 2, 2] {
        tx.send(Ok(Delivery::new(tag, "x"))).unwrap();
    }
    ticks(1).await;

    assert_eq!(session.acks(), vec![1, 2, 2]);
    receiver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failure_of_one_listener_fails_the_delivery() {
    let (session, tx) = InMemorySession::new();
    let receiver =
        RabbitMQReceiver::new("jobs", session.clone(), ReceiverConfigs::default()).unwrap();

    let failing = Counting::new(true);
    let healthy = Counting::new(false);
    receiver.register(failing.clone());
    receiver.register(healthy.clone());

    tx.send(Ok(Delivery::new(7, "x"))).unwrap();
    ticks(1).await;

    assert_eq!(failing.calls(), 1);
    assert_eq!(healthy.calls(), 1);
    assert!(session.acks().is_empty());

    receiver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn registering_twice_dispatches_once() {
    let (session, tx) = InMemorySession::new();
    let receiver = RabbitMQReceiver::new(
        "jobs",
        session.clone(),
        ReceiverConfigs::default().sequential_handlers(),
    )
    .unwrap();

    let handler = Counting::new(false);
    receiver.register(handler.clone());
    receiver.register(handler.clone());
    assert_eq!(receiver.listeners(), 1);

    tx.send(Ok(Delivery::new(1, "x"))).unwrap();
    ticks(1).await;

    assert_eq!(handler.calls(), 1);
    assert_eq!(session.acks(), vec![1]);

    receiver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn receive_errors_reach_listeners_and_dead_loops_restart() {
    let (session, tx) = InMemorySession::new();
    let receiver = RabbitMQReceiver::new(
        "jobs",
        session.clone(),
        ReceiverConfigs::default().check_period(Duration::from_millis(500)),
    )
    .unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    struct Recorder(Arc<Mutex<Vec<SessionError>>>);

    #[async_trait]
    impl Handler for Recorder {
        async fn on_delivery(
            &self,
            _ctx: &Context,
            _delivery: &Delivery,
        ) -> Result<(), HandlerError> {
            Ok(())
        }

        async fn on_receive_error(&self, error: &SessionError) {
            self.0.lock().unwrap().push(error.clone());
        }
    }

    receiver.register(Arc::new(Recorder(errors.clone())));
    tx.send(Err(SessionError::FetchError("flow".into()))).unwrap();
    tx.send(Err(SessionError::Closed("channel reset".into())))
        .unwrap();
    tx.send(Ok(Delivery::new(3, "after restart"))).unwrap();
    ticks(2).await;

    assert_eq!(receiver.loop_starts(), 2);
    assert_eq!(
        receiver.last_crash(),
        Some(LoopCrash::SessionClosed(SessionError::Closed(
            "channel reset".into()
        )))
    );
    assert_eq!(errors.lock().unwrap().len(), 2);
    assert_eq!(session.acks(), vec![3]);

    receiver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_stops_consuming_for_good() {
    let (session, _tx) = InMemorySession::new();
    let receiver = RabbitMQReceiver::new(
        "jobs",
        session.clone(),
        ReceiverConfigs::default().runtime(tokio::runtime::Handle::current()),
    )
    .unwrap();

    receiver.register(HandlerFn::arc(|_| async { Ok(()) }));
    ticks(1).await;
    assert!(receiver.is_alive());
    assert!(receiver.is_consuming());

    receiver.close().await.unwrap();
    receiver.close().await.unwrap();
    ticks(5).await;

    assert!(receiver.is_closed());
    assert!(!receiver.is_alive());
    assert!(!receiver.is_consuming());
    assert_eq!(receiver.loop_starts(), 1);
}

#[test]
fn creating_outside_a_runtime_fails() {
    let (session, _tx) = InMemorySession::new();
    assert!(RabbitMQReceiver::new("jobs", session, ReceiverConfigs::default()).is_err());
}
