// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming hand-off of flushed series to the serializer.
//!
//! The worker pushes points into a bounded channel while it flushes; a
//! background consumer drains them in chunks into a [`SeriesWriter`]. The
//! flush coordinator waits on the consumer, not on the producer, so the output
//! is always finalized before a flush returns.

use crate::errors::DeliveryError;
use crate::sampler::SeriesPoint;
use crate::serializer::SeriesWriter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// What the consumer did with one flush's series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub series: usize,
    pub payloads: usize,
    /// Chunks the writer refused.
    pub failed_chunks: usize,
}

/// Producer side of the sink. Dropping it is equivalent to [`SeriesSink::producer_done`].
#[derive(Debug)]
pub struct SeriesSink {
    tx: mpsc::Sender<SeriesPoint>,
}

impl SeriesSink {
    /// Spawns the consumer task and returns both ends of the sink.
    pub fn start(
        writer: Box<dyn SeriesWriter>,
        channel_size: usize,
        buffer_size: usize,
        log_payloads: bool,
    ) -> (Self, SinkCompletion) {
        let (tx, rx) = mpsc::channel(channel_size.max(1));
        let handle = tokio::spawn(consume(rx, writer, buffer_size.max(1), log_payloads));
        (Self { tx }, SinkCompletion { handle })
    }

    /// Waits for channel capacity, then hands the point to the consumer.
    pub async fn push(&self, point: SeriesPoint) -> Result<(), DeliveryError> {
        self.tx
            .send(point)
            .await
            .map_err(|_| DeliveryError::Payload("series consumer is gone".to_string()))
    }

    /// Signals that no more points will be pushed.
    pub fn producer_done(self) {
        drop(self.tx);
    }
}

async fn consume(
    mut rx: mpsc::Receiver<SeriesPoint>,
    mut writer: Box<dyn SeriesWriter>,
    buffer_size: usize,
    log_payloads: bool,
) -> Result<SinkReport, DeliveryError> {
    let mut report = SinkReport::default();
    let mut chunk = Vec::with_capacity(buffer_size);

    loop {
        let limit = buffer_size - chunk.len();
        let received = rx.recv_many(&mut chunk, limit).await;
        let closed = received == 0;

        if chunk.len() >= buffer_size || (closed && !chunk.is_empty()) {
            if log_payloads {
                for point in &chunk {
                    info!(
                        metric = %point.name,
                        kind = %point.kind,
                        value = point.value,
                        timestamp = point.timestamp,
                        "Flushing serie"
                    );
                }
            }
            report.series += chunk.len();
            // Keep draining so the producer never stalls on a dead consumer.
            if let Err(e) = writer.write_series(&chunk).await {
                error!("Failed to serialize {} series: {e}", chunk.len());
                report.failed_chunks += 1;
            }
            chunk.clear();
        }

        if closed {
            break;
        }
    }

    report.payloads = writer.finish().await?;
    debug!(
        series = report.series,
        payloads = report.payloads,
        "Series sink finished"
    );
    Ok(report)
}

/// Consumer side of the sink.
#[derive(Debug)]
pub struct SinkCompletion {
    handle: JoinHandle<Result<SinkReport, DeliveryError>>,
}

impl SinkCompletion {
    /// Resolves once the consumer has finalized the output.
    pub async fn wait(self) -> Result<SinkReport, DeliveryError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(DeliveryError::Payload(format!(
                "series consumer task failed: {e}"
            ))),
        }
    }

    /// Tears down a consumer whose flush never reached the worker.
    pub fn abort(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metric::{MetricKind, SortedTags};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tracing_test::traced_test;
    use ustr::Ustr;

    #[derive(Default)]
    struct Recorded {
        chunks: Vec<usize>,
        finished: bool,
    }

    struct RecordingWriter {
        recorded: Arc<Mutex<Recorded>>,
        fail_writes: bool,
    }

    #[async_trait]
    impl SeriesWriter for RecordingWriter {
        async fn write_series(&mut self, points: &[SeriesPoint]) -> Result<(), DeliveryError> {
            self.recorded.lock().unwrap().chunks.push(points.len());
            if self.fail_writes {
                return Err(DeliveryError::Payload("rejected".to_string()));
            }
            Ok(())
        }

        async fn finish(self: Box<Self>) -> Result<usize, DeliveryError> {
            self.recorded.lock().unwrap().finished = true;
            Ok(1)
        }
    }

    fn writer(fail_writes: bool) -> (Box<dyn SeriesWriter>, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        (
            Box::new(RecordingWriter {
                recorded: Arc::clone(&recorded),
                fail_writes,
            }),
            recorded,
        )
    }

    fn point(value: f64) -> SeriesPoint {
        SeriesPoint {
            name: Ustr::from("requests"),
            tags: Arc::new(SortedTags::default()),
            kind: MetricKind::Count,
            value,
            timestamp: 100,
            interval: 10,
            origin: None,
        }
    }

    #[tokio::test]
    async fn test_empty_sink_still_finishes() {
        let (writer, recorded) = writer(false);
        let (sink, completion) = SeriesSink::start(writer, 4, 4, false);
        sink.producer_done();

        let report = completion.wait().await.unwrap();
        assert_eq!(report.series, 0);
        assert_eq!(report.payloads, 1);
        let recorded = recorded.lock().unwrap();
        assert!(recorded.chunks.is_empty());
        assert!(recorded.finished);
    }

    #[tokio::test]
    async fn test_points_are_chunked() {
        let (writer, recorded) = writer(false);
        let (sink, completion) = SeriesSink::start(writer, 2, 3, false);
        let producer = tokio::spawn(async move {
            for i in 0..7 {
                sink.push(point(f64::from(i))).await.unwrap();
            }
            sink.producer_done();
        });

        let report = completion.wait().await.unwrap();
        producer.await.unwrap();
        assert_eq!(report.series, 7);
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.chunks.iter().sum::<usize>(), 7);
        assert!(recorded.chunks.iter().all(|c| *c <= 3));
        assert!(recorded.finished);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_write_failures_do_not_stall_producer() {
        let (writer, recorded) = writer(true);
        let (tx, rx) = mpsc::channel(8);
        for i in 0..5 {
            tx.send(point(f64::from(i))).await.unwrap();
        }
        drop(tx);

        let report = consume(rx, writer, 1, false).await.unwrap();
        assert_eq!(report.series, 5);
        assert_eq!(report.failed_chunks, 5);
        assert!(recorded.lock().unwrap().finished);
        assert!(logs_contain("Failed to serialize 1 series"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_log_payloads() {
        let (writer, _) = writer(false);
        let (tx, rx) = mpsc::channel(1);
        tx.send(point(7.0)).await.unwrap();
        drop(tx);

        consume(rx, writer, 4, true).await.unwrap();
        assert!(logs_contain("Flushing serie"));
    }

    #[tokio::test]
    async fn test_push_after_abort_fails() {
        let (writer, _) = writer(false);
        let (sink, completion) = SeriesSink::start(writer, 1, 1, false);
        completion.abort();
        tokio::task::yield_now().await;
        // The channel may accept one point before the aborted consumer is dropped.
        let mut failed = false;
        for i in 0..4 {
            if sink.push(point(f64::from(i))).await.is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }
}
