// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, io, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time::{timeout, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dogstatsd_demux::{
    config::AggregatorConfig,
    demultiplexer::{ServerlessDemultiplexer, TimeSamplerId},
    errors::Error,
    forwarder::WriterForwarder,
    logger,
    metric::parse,
    pool::ObservationBatch,
};

/// Longest a partially filled batch waits for more lines before it is enqueued.
const BATCH_LINGER: Duration = Duration::from_millis(500);
const INGEST_SHARD: TimeSamplerId = TimeSamplerId(0);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    if let Err(e) = logger::init(&log_level) {
        eprintln!("Unable to initialize logging: {e}");
        return;
    }
    debug!("Logging subsystem enabled");

    let config = match AggregatorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating aggregator config: {e}");
            return;
        }
    };

    let forwarder = Arc::new(WriterForwarder::new(io::stdout()));
    let demux = match ServerlessDemultiplexer::start(config.clone(), forwarder) {
        Ok(demux) => Arc::new(demux),
        Err(e) => {
            error!("Error starting demultiplexer: {e}");
            return;
        }
    };

    let cancel = CancellationToken::new();
    let flush_task = demux.start_periodic_flush(
        Duration::from_secs(config.flush_interval_secs),
        cancel.clone(),
    );
    info!(
        flush_interval = config.flush_interval_secs,
        "Reading DogStatsD lines from stdin"
    );

    if let Err(e) = ingest_stdin(&demux).await {
        error!("Ingestion stopped: {e}");
    }

    cancel.cancel();
    if let Err(e) = flush_task.await {
        error!("Periodic flush task failed: {e}");
    }
    if let Err(e) = demux.stop(true).await {
        error!("Error stopping demultiplexer: {e}");
    }
    debug!("Shut down");
}

async fn ingest_stdin(demux: &ServerlessDemultiplexer) -> Result<(), Error> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut batch: Option<ObservationBatch> = None;

    loop {
        let line = match timeout(BATCH_LINGER, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                error!("Failed to read from stdin: {e}");
                break;
            }
            Err(_) => {
                // Quiet input: hand over what has been collected so far.
                if let Some(pending) = batch.take() {
                    demux.add_sample_batch(INGEST_SHARD, pending).await?;
                }
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }
        let sample = match parse(&line) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Dropping metric '{line}': {e}");
                continue;
            }
        };

        let mut current = match batch.take() {
            Some(current) => current,
            None => demux.sample_pool().acquire().await?,
        };
        if let Err(sample) = current.push(sample) {
            demux.add_sample_batch(INGEST_SHARD, current).await?;
            current = demux.sample_pool().acquire().await?;
            if current.push(sample).is_err() {
                warn!("Dropping metric '{line}': batch has no capacity");
            }
        }
        batch = Some(current);
    }

    if let Some(pending) = batch.take() {
        demux.add_sample_batch(INGEST_SHARD, pending).await?;
    }
    Ok(())
}
