// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The public entry point of the aggregation pipeline.
//!
//! [`ServerlessDemultiplexer`] owns the sample pool, the aggregation worker and
//! the delivery collaborators. Ingestion calls and flushes take the same lock,
//! so at most one flush is in flight and no sample is enqueued while a flush
//! is being set up.

use crate::config::AggregatorConfig;
use crate::errors::Error;
use crate::forwarder::Forwarder;
use crate::metric::{self, MetricSample};
use crate::pool::{ObservationBatch, SamplePool};
use crate::sampler::{self, SamplerStats, TimeSampler};
use crate::serializer::{JsonSerializer, MetricSerializer};
use crate::series_sink::SeriesSink;
use crate::worker::{TimeSamplerWorker, WorkerHandle};
use derive_more::{Display, Into};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identifies a sampler shard. There is a single worker, so it has no effect.
#[derive(Clone, Copy, Debug, Default, Display, Into, PartialEq, Eq, Hash)]
pub struct TimeSamplerId(pub usize);

/// Summary of one completed flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub series: usize,
    pub sketches: usize,
    /// Series payloads emitted by the serializer.
    pub payloads: usize,
    /// Series or sketch deliveries that failed. Never fatal to the flush.
    pub delivery_failures: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DemultiplexerStats {
    pub pool_capacity: usize,
    pub pool_in_flight: usize,
    pub overflow_batches: u64,
    /// Sampler counters as of the last flush.
    pub sampler: SamplerStats,
    pub flushes: u64,
}

pub struct ServerlessDemultiplexer {
    config: AggregatorConfig,
    pool: SamplePool,
    worker: WorkerHandle,
    worker_task: Mutex<Option<JoinHandle<SamplerStats>>>,
    serializer: Arc<dyn MetricSerializer>,
    forwarder: Arc<dyn Forwarder>,
    flush_lock: TokioMutex<()>,
    stats: Mutex<DemultiplexerStats>,
    stopped: AtomicBool,
}

impl ServerlessDemultiplexer {
    /// Starts the forwarder and the aggregation worker, serializing payloads as JSON.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: AggregatorConfig, forwarder: Arc<dyn Forwarder>) -> Result<Self, Error> {
        let serializer = Arc::new(JsonSerializer::new(
            Arc::clone(&forwarder),
            config.max_series_per_payload,
        ));
        Self::start_with_serializer(config, forwarder, serializer)
    }

    pub fn start_with_serializer(
        config: AggregatorConfig,
        forwarder: Arc<dyn Forwarder>,
        serializer: Arc<dyn MetricSerializer>,
    ) -> Result<Self, Error> {
        config.validate()?;
        forwarder.start()?;

        let pool = SamplePool::new(
            config.aggregator_buffer_size,
            config.metric_sample_batch_size,
            config.pool_exhaustion,
        );
        let sampler = TimeSampler::new(
            config.bucket_width_secs,
            config.grace_period_secs,
            config.aggregator_max_contexts,
            config.aggregator_use_tags_store,
        );
        let (worker, handle) =
            TimeSamplerWorker::new(sampler, pool.clone(), config.aggregator_buffer_size);
        let worker_task = tokio::spawn(worker.run());

        debug!(
            buffer_size = config.aggregator_buffer_size,
            bucket_width = config.bucket_width_secs,
            "Demultiplexer started"
        );

        Ok(Self {
            config,
            pool,
            worker: handle,
            worker_task: Mutex::new(Some(worker_task)),
            serializer,
            forwarder,
            flush_lock: TokioMutex::new(()),
            stats: Mutex::new(DemultiplexerStats::default()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Flushes every bucket that closed before `start`, blocking until the
    /// series output is finalized and the sketches are handed off.
    pub async fn force_flush(&self, start: i64, wait_for_delivery: bool) -> Result<FlushReport, Error> {
        let _guard = self.flush_lock.lock().await;

        let writer = self.serializer.series_writer(wait_for_delivery);
        let (sink, completion) = SeriesSink::start(
            writer,
            self.config.flush_series_channel_size,
            self.config.flush_series_buffer_size,
            self.config.log_payloads,
        );

        let outcome = match self.worker.flush(start, sink).await {
            Ok(outcome) => outcome,
            Err(e) => {
                completion.abort();
                return Err(e);
            }
        };

        let mut report = FlushReport {
            series: outcome.series,
            sketches: outcome.sketches.len(),
            ..Default::default()
        };

        match completion.wait().await {
            Ok(sink_report) => {
                report.payloads = sink_report.payloads;
                report.delivery_failures += sink_report.failed_chunks;
            }
            Err(e) => {
                error!("Failed to flush series: {e}");
                report.delivery_failures += 1;
            }
        }

        if !outcome.sketches.is_empty() {
            if self.config.log_payloads {
                for sketch in &outcome.sketches {
                    info!(
                        metric = %sketch.name,
                        kind = %sketch.kind,
                        count = sketch.sketch.count(),
                        timestamp = sketch.timestamp,
                        "Flushing sketch"
                    );
                }
            }
            if let Err(e) = self
                .serializer
                .send_sketches(outcome.sketches, wait_for_delivery)
                .await
            {
                error!("Failed to flush sketches: {e}");
                report.delivery_failures += 1;
            }
        }

        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.sampler = outcome.stats;
            stats.flushes += 1;
        }

        debug!(
            start,
            series = report.series,
            sketches = report.sketches,
            payloads = report.payloads,
            "Flush completed"
        );
        Ok(report)
    }

    /// Enqueues a single sample.
    pub async fn add_sample(&self, sample: MetricSample) -> Result<(), Error> {
        // The batch is taken before the lock: holders of pooled batches need
        // the lock to hand them back.
        let mut batch = self.pool.acquire().await?;
        if batch.push(sample).is_err() {
            // Only possible with a zero batch size, which validation rejects.
            self.pool.release(batch);
            return Err(Error::InvalidConfig(
                "metric_sample_batch_size must be greater than 0".to_string(),
            ));
        }

        let _guard = self.flush_lock.lock().await;
        self.enqueue(batch).await
    }

    /// Enqueues a batch filled from [`Self::sample_pool`]. The shard is ignored.
    pub async fn add_sample_batch(
        &self,
        shard: TimeSamplerId,
        batch: ObservationBatch,
    ) -> Result<(), Error> {
        let _guard = self.flush_lock.lock().await;
        debug!(shard = %shard, samples = batch.len(), "Received sample batch");
        self.enqueue(batch).await
    }

    async fn enqueue(&self, batch: ObservationBatch) -> Result<(), Error> {
        if batch.is_empty() {
            self.pool.release(batch);
            return Ok(());
        }
        self.worker.send_samples(batch).await
    }

    /// Check runs are not supported in this environment.
    pub fn add_check_sample(&self, _sample: MetricSample) -> Result<(), Error> {
        Err(Error::Unsupported("check samples"))
    }

    /// Shuts the pipeline down, optionally flushing every bucket that has
    /// started by now.
    pub async fn stop(&self, flush_first: bool) -> Result<(), Error> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if flush_first {
            let cutoff = metric::now()
                .saturating_add(self.config.bucket_width_secs)
                .saturating_add(self.config.grace_period_secs);
            if let Err(e) = self.force_flush(cutoff, true).await {
                warn!("Final flush failed: {e}");
            }
        }

        {
            // Keeps producers out while the worker drains.
            let _guard = self.flush_lock.lock().await;
            if let Err(e) = self.worker.stop().await {
                debug!("Worker already stopped: {e}");
            }
        }

        let task = self
            .worker_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            match task.await {
                Ok(stats) => {
                    self.stats
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .sampler = stats;
                }
                Err(e) => error!("Time sampler worker failed: {e}"),
            }
        }

        self.pool.close();
        self.forwarder.stop();
        debug!("Demultiplexer stopped");
        Ok(())
    }

    /// Flushes every `interval` until `cancel` fires.
    pub fn start_periodic_flush(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let demux = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("Periodic flush cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let cutoff = demux.closed_bucket_cutoff(metric::now());
                        match demux.force_flush(cutoff, false).await {
                            Ok(_) => {}
                            Err(Error::WorkerStopped) => break,
                            Err(e) => error!("Periodic flush failed: {e}"),
                        }
                    }
                }
            }
        })
    }

    /// Cutoff that closes only the buckets that ended by `now`, leaving the
    /// one still filling open.
    #[must_use]
    pub fn closed_bucket_cutoff(&self, now: i64) -> i64 {
        sampler::align_to_bucket(now, self.config.bucket_width_secs).unwrap_or(now)
    }

    /// The pool producers fill batches from before calling [`Self::add_sample_batch`].
    #[must_use]
    pub fn sample_pool(&self) -> &SamplePool {
        &self.pool
    }

    #[must_use]
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> DemultiplexerStats {
        let stats = *self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        DemultiplexerStats {
            pool_capacity: self.pool.capacity(),
            pool_in_flight: self.pool.in_flight(),
            overflow_batches: self.pool.overflow_batches(),
            ..stats
        }
    }
}
