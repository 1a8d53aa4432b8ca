// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Ledger
//!
//! In-memory record of the delivery tags that already failed once. A tag is
//! evicted as soon as its delivery reaches a terminal acknowledgment, so the
//! ledger only holds deliveries currently waiting for their retry.

use crate::delivery::DeliveryTag;
use std::collections::HashSet;

/// Set of delivery tags that failed once and wait for their redelivery.
///
/// Shared by every execution of the dispatch loop of a receiver, so a pending
/// retry survives a loop restart.
#[derive(Debug, Default)]
pub struct RetryLedger {
    failed: HashSet<DeliveryTag>,
}

impl RetryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure of `tag`.
    ///
    /// # Returns
    /// `true` on the first failure of the tag, `false` when it had already failed
    pub fn record_failure(&mut self, tag: DeliveryTag) -> bool {
        self.failed.insert(tag)
    }

    /// Whether `tag` already failed once and was not evicted since.
    pub fn contains(&self, tag: DeliveryTag) -> bool {
        self.failed.contains(&tag)
    }

    /// Forgets `tag`. Returns whether it was present.
    pub fn evict(&mut self, tag: DeliveryTag) -> bool {
        self.failed.remove(&tag)
    }

    pub fn len(&self) -> usize {
        self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }
}
