// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The aggregation worker: sole owner of the [`TimeSampler`].
//!
//! Sample batches and flush requests share one bounded FIFO queue, so every
//! batch enqueued before a flush request is aggregated before that flush runs.

use crate::errors::Error;
use crate::pool::{ObservationBatch, SamplePool};
use crate::sampler::{SamplerStats, SketchSeries, TimeSampler};
use crate::series_sink::SeriesSink;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

#[derive(Debug)]
pub struct FlushRequest {
    /// Buckets starting before `cutoff - grace_period` are closed.
    pub cutoff: i64,
    pub sink: SeriesSink,
    pub done: oneshot::Sender<FlushOutcome>,
}

/// Handed back to the coordinator once a flush has run.
#[derive(Debug)]
pub struct FlushOutcome {
    pub sketches: Vec<SketchSeries>,
    /// Series pushed into the sink.
    pub series: usize,
    pub stats: SamplerStats,
}

#[derive(Debug)]
pub enum WorkerCommand {
    Samples(ObservationBatch),
    Flush(FlushRequest),
    Stop,
}

#[derive(Clone, Debug)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    /// Enqueues a filled batch, waiting for queue capacity.
    pub async fn send_samples(&self, batch: ObservationBatch) -> Result<(), Error> {
        self.tx
            .send(WorkerCommand::Samples(batch))
            .await
            .map_err(|_| Error::WorkerStopped)
    }

    /// Enqueues a flush request and waits for the worker to run it.
    pub async fn flush(&self, cutoff: i64, sink: SeriesSink) -> Result<FlushOutcome, Error> {
        let (done, completion) = oneshot::channel();
        self.tx
            .send(WorkerCommand::Flush(FlushRequest { cutoff, sink, done }))
            .await
            .map_err(|_| Error::WorkerStopped)?;

        completion
            .await
            .map_err(|e| Error::FlushAborted(format!("worker dropped the flush request: {e}")))
    }

    /// Asks the worker to drain what is already queued and exit.
    pub async fn stop(&self) -> Result<(), Error> {
        self.tx
            .send(WorkerCommand::Stop)
            .await
            .map_err(|_| Error::WorkerStopped)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct TimeSamplerWorker {
    sampler: TimeSampler,
    pool: SamplePool,
    rx: mpsc::Receiver<WorkerCommand>,
}

impl TimeSamplerWorker {
    #[must_use]
    pub fn new(sampler: TimeSampler, pool: SamplePool, queue_size: usize) -> (Self, WorkerHandle) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let worker = Self { sampler, pool, rx };
        (worker, WorkerHandle { tx })
    }

    pub async fn run(mut self) -> SamplerStats {
        debug!("Time sampler worker started");

        while let Some(command) = self.rx.recv().await {
            match command {
                WorkerCommand::Samples(batch) => self.process_batch(batch),
                WorkerCommand::Flush(request) => self.process_flush(request).await,
                WorkerCommand::Stop => {
                    debug!("Time sampler worker stopping, draining queued commands");
                    // Rejects new submissions; buffered commands are still received.
                    self.rx.close();
                }
            }
        }

        debug!("Time sampler worker stopped");
        self.sampler.stats()
    }

    fn process_batch(&mut self, batch: ObservationBatch) {
        let before = self.sampler.stats();
        for sample in batch.iter() {
            self.sampler.ingest(sample);
        }
        let after = self.sampler.stats();

        let stale = after.stale - before.stale;
        let invalid = after.invalid - before.invalid;
        let overflow = after.context_overflow - before.context_overflow;
        if stale + invalid + overflow > 0 {
            warn!(
                stale,
                invalid,
                context_overflow = overflow,
                "Total of {} metrics failed to aggregate",
                stale + invalid + overflow
            );
        }

        self.pool.release(batch);
    }

    async fn process_flush(&mut self, request: FlushRequest) {
        let FlushRequest { cutoff, sink, done } = request;
        let output = self.sampler.flush(cutoff);

        let mut series = 0;
        for point in output.series {
            if let Err(e) = sink.push(point).await {
                error!("Series sink closed during flush: {e}");
                break;
            }
            series += 1;
        }
        sink.producer_done();

        let outcome = FlushOutcome {
            sketches: output.sketches,
            series,
            stats: self.sampler.stats(),
        };
        if done.send(outcome).is_err() {
            error!("Failed to send flush outcome - receiver dropped");
        }
    }
}
