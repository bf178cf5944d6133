// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pool of reusable sample batches shared by the ingestion front-end and the
//! aggregation worker.
//!
//! A producer acquires a batch, fills it, and hands it to the demultiplexer.
//! The worker consumes it and releases it back here, so that steady-state
//! ingestion does not allocate. The number of batches in flight is bounded by
//! a semaphore; what happens when every batch is taken is decided by the
//! configured [`ExhaustionPolicy`].

use crate::errors::Error;
use crate::metric::MetricSample;
use serde::Deserialize;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// What `acquire` does once every pooled batch is in flight.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Wait until the worker releases a batch.
    #[default]
    Block,
    /// Hand out a batch allocated outside the pool. It is dropped on release.
    Allocate,
    /// Return [`Error::Overflow`] immediately.
    Fail,
}

impl std::str::FromStr for ExhaustionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "allocate" => Ok(Self::Allocate),
            "fail" => Ok(Self::Fail),
            other => Err(Error::InvalidConfig(format!(
                "Invalid pool exhaustion policy '{other}'. Must be one of: block, allocate, fail"
            ))),
        }
    }
}

/// A fixed-capacity, ordered buffer of samples owned by one stage at a time.
#[derive(Debug)]
pub struct ObservationBatch {
    samples: Vec<MetricSample>,
    capacity: usize,
    // None for overflow batches, which never go back to the pool.
    permit: Option<OwnedSemaphorePermit>,
}

impl ObservationBatch {
    fn overflow(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            permit: None,
        }
    }

    /// Appends a sample, handing it back if the batch is already full.
    pub fn push(&mut self, sample: MetricSample) -> Result<(), MetricSample> {
        if self.is_full() {
            return Err(sample);
        }
        self.samples.push(sample);
        Ok(())
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this batch came out of the pool rather than an overflow allocation.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.permit.is_some()
    }

    #[cfg(test)]
    pub(crate) fn buffer_addr(&self) -> usize {
        self.samples.as_ptr() as usize
    }
}

impl Deref for ObservationBatch {
    type Target = [MetricSample];

    fn deref(&self) -> &Self::Target {
        &self.samples
    }
}

struct PoolInner {
    free: Mutex<Vec<Vec<MetricSample>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    batch_size: usize,
    policy: ExhaustionPolicy,
    overflow_batches: AtomicU64,
}

/// Cloneable handle to the shared pool.
#[derive(Clone)]
pub struct SamplePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SamplePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplePool")
            .field("capacity", &self.inner.capacity)
            .field("batch_size", &self.inner.batch_size)
            .field("in_flight", &self.in_flight())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl SamplePool {
    /// Pre-allocates `capacity` batches of `batch_size` samples each.
    #[must_use]
    pub fn new(capacity: usize, batch_size: usize, policy: ExhaustionPolicy) -> Self {
        let free = (0..capacity)
            .map(|_| Vec::with_capacity(batch_size))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                batch_size,
                policy,
                overflow_batches: AtomicU64::new(0),
            }),
        }
    }

    /// Hands out an empty batch, applying the exhaustion policy when none is free.
    pub async fn acquire(&self) -> Result<ObservationBatch, Error> {
        let permits = Arc::clone(&self.inner.permits);
        let permit = match self.inner.policy {
            ExhaustionPolicy::Block => permits
                .acquire_owned()
                .await
                .map_err(|_| Error::PoolClosed)?,
            ExhaustionPolicy::Allocate => match permits.try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    self.inner.overflow_batches.fetch_add(1, Ordering::Relaxed);
                    debug!("Sample pool exhausted, allocating an overflow batch");
                    return Ok(ObservationBatch::overflow(self.inner.batch_size));
                }
                Err(TryAcquireError::Closed) => return Err(Error::PoolClosed),
            },
            ExhaustionPolicy::Fail => match permits.try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    return Err(Error::Overflow {
                        in_flight: self.in_flight(),
                        capacity: self.inner.capacity,
                    })
                }
                Err(TryAcquireError::Closed) => return Err(Error::PoolClosed),
            },
        };

        let samples = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            // A batch dropped without release leaves a permit but no buffer.
            .unwrap_or_else(|| Vec::with_capacity(self.inner.batch_size));
        debug_assert!(samples.is_empty(), "pooled buffer still holds samples");

        Ok(ObservationBatch {
            samples,
            capacity: self.inner.batch_size,
            permit: Some(permit),
        })
    }

    /// Returns a consumed batch. Its contents are discarded.
    pub fn release(&self, mut batch: ObservationBatch) {
        let Some(permit) = batch.permit.take() else {
            return;
        };

        let mut samples = std::mem::take(&mut batch.samples);
        samples.clear();
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(samples);

        // The buffer must be back on the free list before a waiter can wake up.
        drop(permit);
    }

    /// Wakes blocked producers with [`Error::PoolClosed`] and rejects new acquisitions.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    /// Pooled batches acquired and not yet released.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.capacity - self.inner.permits.available_permits()
    }

    #[must_use]
    pub fn overflow_batches(&self) -> u64 {
        self.inner.overflow_batches.load(Ordering::Relaxed)
    }
}
