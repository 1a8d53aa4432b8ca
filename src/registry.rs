// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener Registry
//!
//! Holds the registered [`Handler`]s and the activation gate that keeps the
//! receiver idle until the first handler shows up.
//!
//! ```text
//! register(h) ──► RwLock<Vec<Arc<dyn Handler>>> ──► snapshot() (dispatch loop)
//!      │
//!      └──► ActivationGate::open() ──► wakes every wait() (loop starter)
//! ```
//!
//! The registry never shrinks and the gate never closes once opened.

use crate::handler::Handler;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::debug;

/// One-way latch opened by the first registration.
pub struct ActivationGate {
    tx: watch::Sender<bool>,
}

impl Default for ActivationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivationGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        ActivationGate { tx }
    }

    /// Opens the gate. Calling it again has no effect.
    pub fn open(&self) {
        self.tx.send_if_modified(|opened| {
            if *opened {
                return false;
            }
            *opened = true;
            true
        });
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the gate has been opened; returns immediately afterwards.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this can only fail once the
        // gate is being dropped.
        let _ = rx.wait_for(|opened| *opened).await;
    }
}

/// Set of handlers with identity based membership.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn Handler>>>,
    gate: ActivationGate,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` unless this very instance is already registered, then
    /// opens the activation gate.
    ///
    /// # Returns
    /// `true` when the handler was not registered before
    pub fn register(&self, handler: Arc<dyn Handler>) -> bool {
        let inserted = {
            let mut listeners = self
                .listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner);

            if listeners.iter().any(|l| same_handler(l, &handler)) {
                false
            } else {
                listeners.push(handler);
                true
            }
        };

        if inserted {
            debug!("listener registered");
        }
        self.gate.open();

        inserted
    }

    /// Immutable copy of the current handlers, safe to iterate without holding the lock.
    pub fn snapshot(&self) -> Arc<[Arc<dyn Handler>]> {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        Arc::from(listeners.as_slice())
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_activated(&self) -> bool {
        self.gate.is_open()
    }

    /// Waits until at least one handler has ever been registered.
    pub async fn await_activation(&self) {
        self.gate.wait().await
    }
}

fn same_handler(a: &Arc<dyn Handler>, b: &Arc<dyn Handler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerFn;
    use std::time::Duration;
    use tokio::time::timeout;

    fn noop() -> Arc<dyn Handler> {
        HandlerFn::arc(|_| async { Ok(()) })
    }

    #[test]
    fn registering_the_same_handler_twice_keeps_one_entry() {
        let registry = ListenerRegistry::new();
        let handler = noop();

        assert!(registry.register(handler.clone()));
        assert!(!registry.register(handler.clone()));
        assert_eq!(registry.len(), 1);

        assert!(registry.register(noop()));
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn snapshot_is_not_affected_by_later_registrations() {
        let registry = ListenerRegistry::new();
        registry.register(noop());

        let snapshot = registry.snapshot();
        registry.register(noop());

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn activation_blocks_until_first_registration() {
        let registry = Arc::new(ListenerRegistry::new());
        assert!(!registry.is_activated());

        let waiting = timeout(Duration::from_millis(50), registry.await_activation()).await;
        assert!(waiting.is_err());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.await_activation().await })
            })
            .collect();

        registry.register(noop());

        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter woken")
                .unwrap();
        }

        // stays open for every later caller
        timeout(Duration::from_millis(50), registry.await_activation())
            .await
            .expect("gate stays open");
        assert!(registry.is_activated());
    }

    #[tokio::test]
    async fn opening_the_gate_twice_is_harmless() {
        let gate = ActivationGate::new();
        gate.open();
        gate.open();
        assert!(gate.is_open());
        timeout(Duration::from_millis(50), gate.wait())
            .await
            .expect("open gate does not block");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_registrations_keep_one_entry_per_handler() {
        let registry = Arc::new(ListenerRegistry::new());
        let shared = noop();
        let shared_added = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let writers = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let shared = shared.clone();
                let shared_added = shared_added.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        registry.register(noop());
                        if registry.register(shared.clone()) {
                            shared_added.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect::<Vec<_>>();

        let readers = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let mut seen = 0;
                    for _ in 0..200 {
                        let len = registry.snapshot().len();
                        assert!(len >= seen, "snapshot shrank from {seen} to {len}");
                        seen = len;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect::<Vec<_>>();

        for task in writers.into_iter().chain(readers) {
            task.await.unwrap();
        }

        assert_eq!(shared_added.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 8 * 50 + 1);
        assert_eq!(
            registry
                .snapshot()
                .iter()
                .filter(|handler| same_handler(handler, &shared))
                .count(),
            1
        );
        assert!(registry.is_activated());
    }
}
