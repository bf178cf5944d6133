// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialization of flushed series and sketches into intake payloads.
//!
//! Series are streamed: the [`SeriesWriter`] receives points in chunks while
//! the aggregation worker is still producing them, and cuts a new payload
//! every `max_series_per_payload` points. Sketches are sent as one batch once
//! the flush is complete.

use crate::constants;
use crate::errors::DeliveryError;
use crate::forwarder::{Forwarder, Payload};
use crate::metric::MetricKind;
use crate::sampler::{SeriesPoint, SketchSeries};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

const SERIES_HEADER: &[u8] = b"{\"series\":[";
const SERIES_FOOTER: &[u8] = b"]}";

/// Incremental consumer of the series produced by one flush.
#[async_trait]
pub trait SeriesWriter: Send {
    async fn write_series(&mut self, points: &[SeriesPoint]) -> Result<(), DeliveryError>;

    /// Finalizes the output, even if no series were written. Returns the
    /// number of payloads emitted.
    async fn finish(self: Box<Self>) -> Result<usize, DeliveryError>;
}

#[async_trait]
pub trait MetricSerializer: Send + Sync {
    /// A writer for the series of one flush.
    fn series_writer(&self, wait_for_delivery: bool) -> Box<dyn SeriesWriter>;

    async fn send_sketches(
        &self,
        sketches: Vec<SketchSeries>,
        wait_for_delivery: bool,
    ) -> Result<(), DeliveryError>;
}

/// Encodes payloads as JSON and hands them to a [`Forwarder`].
#[derive(Clone)]
pub struct JsonSerializer {
    forwarder: Arc<dyn Forwarder>,
    max_series_per_payload: usize,
}

impl JsonSerializer {
    #[must_use]
    pub fn new(forwarder: Arc<dyn Forwarder>, max_series_per_payload: usize) -> Self {
        Self {
            forwarder,
            max_series_per_payload: max_series_per_payload.max(1),
        }
    }
}

#[async_trait]
impl MetricSerializer for JsonSerializer {
    fn series_writer(&self, wait_for_delivery: bool) -> Box<dyn SeriesWriter> {
        Box::new(JsonSeriesWriter::new(
            Arc::clone(&self.forwarder),
            self.max_series_per_payload,
            wait_for_delivery,
        ))
    }

    async fn send_sketches(
        &self,
        sketches: Vec<SketchSeries>,
        wait_for_delivery: bool,
    ) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(&SketchPayloadJson {
            sketches: sketches.iter().map(SketchJson::from).collect(),
        })
        .map_err(|e| DeliveryError::Payload(e.to_string()))?;

        debug!("Sending {} sketches", sketches.len());
        deliver(
            &self.forwarder,
            Payload {
                endpoint: constants::SKETCHES_ENDPOINT,
                body,
            },
            wait_for_delivery,
        )
        .await
    }
}

async fn deliver(
    forwarder: &Arc<dyn Forwarder>,
    payload: Payload,
    wait_for_delivery: bool,
) -> Result<(), DeliveryError> {
    if wait_for_delivery {
        return forwarder.submit(payload).await;
    }

    let forwarder = Arc::clone(forwarder);
    tokio::spawn(async move {
        let endpoint = payload.endpoint;
        if let Err(e) = forwarder.submit(payload).await {
            error!("Failed to deliver payload to {endpoint}: {e}");
        }
    });
    Ok(())
}

/// Writes `{"series":[...]}` documents, splitting them at a fixed number of points.
pub struct JsonSeriesWriter {
    forwarder: Arc<dyn Forwarder>,
    max_series_per_payload: usize,
    wait_for_delivery: bool,
    buffer: Vec<u8>,
    in_payload: usize,
    payloads: usize,
}

impl JsonSeriesWriter {
    fn new(forwarder: Arc<dyn Forwarder>, max_series_per_payload: usize, wait_for_delivery: bool) -> Self {
        Self {
            forwarder,
            max_series_per_payload,
            wait_for_delivery,
            buffer: SERIES_HEADER.to_vec(),
            in_payload: 0,
            payloads: 0,
        }
    }

    async fn close_payload(&mut self) -> Result<(), DeliveryError> {
        let mut body = std::mem::replace(&mut self.buffer, SERIES_HEADER.to_vec());
        body.extend_from_slice(SERIES_FOOTER);
        self.in_payload = 0;
        self.payloads += 1;
        deliver(
            &self.forwarder,
            Payload {
                endpoint: constants::SERIES_ENDPOINT,
                body,
            },
            self.wait_for_delivery,
        )
        .await
    }
}

#[async_trait]
impl SeriesWriter for JsonSeriesWriter {
    async fn write_series(&mut self, points: &[SeriesPoint]) -> Result<(), DeliveryError> {
        // The first failure is reported once the whole chunk has been attempted.
        let mut first_error = None;
        for point in points {
            if self.in_payload == self.max_series_per_payload {
                if let Err(e) = self.close_payload().await {
                    first_error.get_or_insert(e);
                }
            }
            let encoded = match serde_json::to_vec(&SerieJson::from(point)) {
                Ok(encoded) => encoded,
                Err(e) => {
                    first_error.get_or_insert(DeliveryError::Payload(e.to_string()));
                    continue;
                }
            };
            if self.in_payload > 0 {
                self.buffer.push(b',');
            }
            self.buffer.extend_from_slice(&encoded);
            self.in_payload += 1;
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn finish(mut self: Box<Self>) -> Result<usize, DeliveryError> {
        if self.in_payload > 0 || self.payloads == 0 {
            self.close_payload().await?;
        }
        Ok(self.payloads)
    }
}

// Intake type codes for series points.
fn series_type(kind: MetricKind) -> u8 {
    match kind {
        MetricKind::Count => 1,
        MetricKind::Rate => 2,
        _ => 3,
    }
}

// Rates are submitted per second over the bucket.
fn series_value(point: &SeriesPoint) -> f64 {
    match point.kind {
        MetricKind::Rate if point.interval > 0 => point.value / point.interval as f64,
        _ => point.value,
    }
}

#[derive(Serialize)]
struct PointJson {
    timestamp: i64,
    value: f64,
}

#[derive(Serialize)]
struct SerieJson<'a> {
    metric: &'a str,
    #[serde(rename = "type")]
    metric_type: u8,
    interval: i64,
    points: [PointJson; 1],
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<&'a str>,
}

impl<'a> From<&'a SeriesPoint> for SerieJson<'a> {
    fn from(point: &'a SeriesPoint) -> Self {
        Self {
            metric: point.name.as_str(),
            metric_type: series_type(point.kind),
            interval: point.interval,
            points: [PointJson {
                timestamp: point.timestamp,
                value: series_value(point),
            }],
            tags: point.tags.to_strings(),
            origin: point.origin.as_ref().map(|o| o.as_str()),
        }
    }
}

#[derive(Serialize)]
struct DogsketchJson {
    ts: i64,
    cnt: u64,
    min: f64,
    max: f64,
    avg: f64,
    sum: f64,
}

#[derive(Serialize)]
struct SketchJson<'a> {
    metric: &'a str,
    tags: Vec<String>,
    interval: i64,
    dogsketches: [DogsketchJson; 1],
}

impl<'a> From<&'a SketchSeries> for SketchJson<'a> {
    fn from(series: &'a SketchSeries) -> Self {
        let sketch = &series.sketch;
        Self {
            metric: series.name.as_str(),
            tags: series.tags.to_strings(),
            interval: series.interval,
            dogsketches: [DogsketchJson {
                ts: series.timestamp,
                cnt: sketch.count() as u64,
                min: sketch.min().unwrap_or_default(),
                max: sketch.max().unwrap_or_default(),
                avg: sketch.avg().unwrap_or_default(),
                sum: sketch.sum().unwrap_or_default(),
            }],
        }
    }
}

#[derive(Serialize)]
struct SketchPayloadJson<'a> {
    sketches: Vec<SketchJson<'a>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::forwarder::CaptureForwarder;
    use crate::metric::{MetricKind, SortedTags};
    use ddsketch_agent::DDSketch;
    use ustr::Ustr;

    fn point(name: &str, value: f64) -> SeriesPoint {
        SeriesPoint {
            name: Ustr::from(name),
            tags: Arc::new(SortedTags::parse("env:prod").unwrap()),
            kind: MetricKind::Count,
            value,
            timestamp: 100,
            interval: 10,
            origin: None,
        }
    }

    fn started_forwarder() -> Arc<CaptureForwarder> {
        let forwarder = Arc::new(CaptureForwarder::new());
        forwarder.start().unwrap();
        forwarder
    }

    #[tokio::test]
    async fn test_empty_series_payload_is_well_formed() {
        let forwarder = started_forwarder();
        let serializer = JsonSerializer::new(forwarder.clone(), 10);

        let writer = serializer.series_writer(true);
        assert_eq!(writer.finish().await.unwrap(), 1);

        let payloads = forwarder.payloads_for(constants::SERIES_ENDPOINT);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].body_lossy(), r#"{"series":[]}"#);
    }

    #[tokio::test]
    async fn test_series_payload_content() {
        let forwarder = started_forwarder();
        let serializer = JsonSerializer::new(forwarder.clone(), 10);

        let mut writer = serializer.series_writer(true);
        writer.write_series(&[point("a", 7.0)]).await.unwrap();
        writer.finish().await.unwrap();

        let payloads = forwarder.payloads_for(constants::SERIES_ENDPOINT);
        let body: serde_json::Value = serde_json::from_slice(&payloads[0].body).unwrap();
        let serie = &body["series"][0];
        assert_eq!(serie["metric"], "a");
        assert_eq!(serie["type"], 1);
        assert_eq!(serie["interval"], 10);
        assert_eq!(serie["points"][0]["timestamp"], 100);
        assert_eq!(serie["points"][0]["value"], 7.0);
        assert_eq!(serie["tags"][0], "env:prod");
        assert!(serie.get("origin").is_none());
    }

    #[tokio::test]
    async fn test_rates_are_per_second() {
        let forwarder = started_forwarder();
        let serializer = JsonSerializer::new(forwarder.clone(), 10);

        let rate = SeriesPoint {
            kind: MetricKind::Rate,
            ..point("r", 30.0)
        };
        let mut writer = serializer.series_writer(true);
        writer.write_series(&[rate, point("c", 30.0)]).await.unwrap();
        writer.finish().await.unwrap();

        let payloads = forwarder.payloads_for(constants::SERIES_ENDPOINT);
        let body: serde_json::Value = serde_json::from_slice(&payloads[0].body).unwrap();
        assert_eq!(body["series"][0]["type"], 2);
        assert_eq!(body["series"][0]["points"][0]["value"], 3.0);
        assert_eq!(body["series"][1]["points"][0]["value"], 30.0);
    }

    #[tokio::test]
    async fn test_failed_payload_does_not_drop_rest_of_chunk() {
        let forwarder = started_forwarder();
        forwarder.fail_next(1);
        let serializer = JsonSerializer::new(forwarder.clone(), 1);

        let mut writer = serializer.series_writer(true);
        let written = writer
            .write_series(&[point("a", 1.0), point("b", 2.0), point("c", 3.0)])
            .await;
        assert!(written.is_err());
        assert_eq!(writer.finish().await.unwrap(), 3);

        let delivered: Vec<_> = forwarder
            .payloads_for(constants::SERIES_ENDPOINT)
            .iter()
            .map(|p| {
                let body: serde_json::Value = serde_json::from_slice(&p.body).unwrap();
                body["series"][0]["metric"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(delivered, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_series_split_across_payloads() {
        let forwarder = started_forwarder();
        let serializer = JsonSerializer::new(forwarder.clone(), 2);

        let mut writer = serializer.series_writer(true);
        writer
            .write_series(&[point("a", 1.0), point("b", 2.0), point("c", 3.0)])
            .await
            .unwrap();
        writer.write_series(&[point("d", 4.0)]).await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), 2);

        let payloads = forwarder.payloads_for(constants::SERIES_ENDPOINT);
        assert_eq!(payloads.len(), 2);
        for payload in &payloads {
            let body: serde_json::Value = serde_json::from_slice(&payload.body).unwrap();
            assert_eq!(body["series"].as_array().unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_exact_multiple_does_not_emit_trailing_empty_payload() {
        let forwarder = started_forwarder();
        let serializer = JsonSerializer::new(forwarder.clone(), 2);

        let mut writer = serializer.series_writer(true);
        writer
            .write_series(&[point("a", 1.0), point("b", 2.0)])
            .await
            .unwrap();
        assert_eq!(writer.finish().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_sketches_payload() {
        let forwarder = started_forwarder();
        let serializer = JsonSerializer::new(forwarder.clone(), 10);

        let mut sketch = DDSketch::default();
        sketch.insert(2.0);
        sketch.insert(4.0);
        let series = SketchSeries {
            name: Ustr::from("latency"),
            tags: Arc::new(SortedTags::default()),
            kind: MetricKind::Distribution,
            timestamp: 100,
            interval: 10,
            origin: None,
            sketch,
        };
        serializer.send_sketches(vec![series], true).await.unwrap();

        let payloads = forwarder.payloads_for(constants::SKETCHES_ENDPOINT);
        assert_eq!(payloads.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&payloads[0].body).unwrap();
        let dogsketch = &body["sketches"][0]["dogsketches"][0];
        assert_eq!(body["sketches"][0]["metric"], "latency");
        assert_eq!(dogsketch["cnt"], 2);
        assert_eq!(dogsketch["ts"], 100);
    }

    #[tokio::test]
    async fn test_delivery_failure_surfaces_when_waiting() {
        let forwarder = started_forwarder();
        forwarder.set_failing(true);
        let serializer = JsonSerializer::new(forwarder.clone(), 10);

        let writer = serializer.series_writer(true);
        assert!(writer.finish().await.is_err());
    }

    #[tokio::test]
    async fn test_no_wait_detaches_delivery() {
        let forwarder = started_forwarder();
        forwarder.set_failing(true);
        let serializer = JsonSerializer::new(forwarder.clone(), 10);

        // Failures are only logged once delivery is detached.
        let writer = serializer.series_writer(false);
        assert_eq!(writer.finish().await.unwrap(), 1);
    }
}
