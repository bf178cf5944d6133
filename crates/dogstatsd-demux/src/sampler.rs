// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-bucketed aggregation state.
//!
//! Samples are rolled up per context into buckets of `bucket_width` seconds,
//! keyed by the bucket start. A bucket covers `[start, start + width)`. The
//! sampler has no internal locking: it is owned by the aggregation worker and
//! nothing else touches it.

use crate::metric::{ContextKey, MetricKind, MetricSample, SortedTags};
use crate::tags_store::TagsStore;
use ddsketch_agent::DDSketch;
use fnv::FnvHasher;
use std::collections::BTreeMap;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use tracing::{debug, trace};
use ustr::Ustr;

type FnvHashMap<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<FnvHasher>>;

/// One aggregated point of a count, rate or gauge context.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesPoint {
    pub name: Ustr,
    pub tags: Arc<SortedTags>,
    pub kind: MetricKind,
    pub value: f64,
    /// Start of the bucket the point summarizes.
    pub timestamp: i64,
    /// Bucket width in seconds.
    pub interval: i64,
    pub origin: Option<Ustr>,
}

/// The sketch of a histogram or distribution context over one bucket.
#[derive(Clone, Debug)]
pub struct SketchSeries {
    pub name: Ustr,
    pub tags: Arc<SortedTags>,
    pub kind: MetricKind,
    pub timestamp: i64,
    pub interval: i64,
    pub origin: Option<Ustr>,
    pub sketch: DDSketch,
}

/// Everything closed by one call to [`TimeSampler::flush`].
#[derive(Debug, Default)]
pub struct FlushOutput {
    pub series: Vec<SeriesPoint>,
    pub sketches: Vec<SketchSeries>,
}

/// What happened to a single ingested sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Aggregated,
    /// Its bucket was already flushed.
    Stale,
    /// Non-finite value, empty name, or a kind that conflicts with the bucket.
    Invalid,
    /// A new context beyond the configured limit.
    ContextLimit,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub ingested: u64,
    pub stale: u64,
    pub invalid: u64,
    pub context_overflow: u64,
    pub flushed_series: u64,
    pub flushed_sketches: u64,
}

enum Aggregate {
    Sum(f64),
    Last(f64),
    Sketch(Box<DDSketch>),
}

impl Aggregate {
    fn new(kind: MetricKind, value: f64) -> Self {
        if kind.is_sketch() {
            let mut sketch = DDSketch::default();
            sketch.insert(value);
            return Self::Sketch(Box::new(sketch));
        }
        match kind {
            MetricKind::Gauge => Self::Last(value),
            _ => Self::Sum(value),
        }
    }

    fn merge(&mut self, value: f64) {
        match self {
            Self::Sum(sum) => *sum += value,
            Self::Last(last) => *last = value,
            Self::Sketch(sketch) => sketch.insert(value),
        }
    }
}

struct Bucket {
    name: Ustr,
    kind: MetricKind,
    tags: Arc<SortedTags>,
    origin: Option<Ustr>,
    value: Aggregate,
}

/// Aligns `timestamp` down to a multiple of `width`.
#[must_use]
pub fn align_to_bucket(timestamp: i64, width: i64) -> Option<i64> {
    let width = width.max(1);
    timestamp.div_euclid(width).checked_mul(width)
}

pub struct TimeSampler {
    bucket_width: i64,
    grace_period: i64,
    max_contexts: usize,
    buckets: BTreeMap<i64, FnvHashMap<ContextKey, Bucket>>,
    // Number of open buckets referencing each context.
    contexts: FnvHashMap<ContextKey, usize>,
    tags_store: TagsStore,
    // Every bucket starting before this has been flushed.
    watermark: Option<i64>,
    stats: SamplerStats,
}

impl TimeSampler {
    #[must_use]
    pub fn new(bucket_width: i64, grace_period: i64, max_contexts: usize, use_tags_store: bool) -> Self {
        Self {
            bucket_width: bucket_width.max(1),
            grace_period: grace_period.max(0),
            max_contexts,
            buckets: BTreeMap::new(),
            contexts: FnvHashMap::default(),
            tags_store: TagsStore::new(use_tags_store),
            watermark: None,
            stats: SamplerStats::default(),
        }
    }

    /// Start of the bucket containing `timestamp`, or `None` when it falls
    /// outside the representable range.
    #[must_use]
    pub fn bucket_start(&self, timestamp: i64) -> Option<i64> {
        align_to_bucket(timestamp, self.bucket_width)
    }

    pub fn ingest(&mut self, sample: &MetricSample) -> IngestOutcome {
        if sample.name.is_empty() || !sample.value.is_finite() {
            trace!(metric = %sample.name, value = sample.value, "Dropping malformed sample");
            self.stats.invalid += 1;
            return IngestOutcome::Invalid;
        }

        let Some(bucket_start) = self.bucket_start(sample.timestamp) else {
            trace!(
                metric = %sample.name,
                timestamp = sample.timestamp,
                "Dropping sample with an out of range timestamp"
            );
            self.stats.invalid += 1;
            return IngestOutcome::Invalid;
        };
        if self.watermark.is_some_and(|watermark| bucket_start < watermark) {
            trace!(
                metric = %sample.name,
                timestamp = sample.timestamp,
                "Dropping sample older than the oldest open bucket"
            );
            self.stats.stale += 1;
            return IngestOutcome::Stale;
        }

        let contexts = self.buckets.entry(bucket_start).or_default();
        if let Some(bucket) = contexts.get_mut(&sample.context) {
            if bucket.kind != sample.kind {
                trace!(
                    metric = %sample.name,
                    existing = %bucket.kind,
                    received = %sample.kind,
                    "Dropping sample with a conflicting kind"
                );
                self.stats.invalid += 1;
                return IngestOutcome::Invalid;
            }
            bucket.value.merge(sample.value);
            self.stats.ingested += 1;
            return IngestOutcome::Aggregated;
        }

        let tracked = self.contexts.contains_key(&sample.context);
        if !tracked && self.contexts.len() >= self.max_contexts {
            if contexts.is_empty() {
                self.buckets.remove(&bucket_start);
            }
            self.stats.context_overflow += 1;
            return IngestOutcome::ContextLimit;
        }

        let tags = self.tags_store.insert(sample.context, &sample.tags);
        contexts.insert(
            sample.context,
            Bucket {
                name: sample.name,
                kind: sample.kind,
                tags,
                origin: sample.origin,
                value: Aggregate::new(sample.kind, sample.value),
            },
        );
        *self.contexts.entry(sample.context).or_insert(0) += 1;
        self.stats.ingested += 1;
        IngestOutcome::Aggregated
    }

    /// Closes every bucket starting before `cutoff - grace_period`.
    ///
    /// Series come out ordered by bucket start, then by context key.
    pub fn flush(&mut self, cutoff: i64) -> FlushOutput {
        let threshold = cutoff.saturating_sub(self.grace_period);
        let open = self.buckets.split_off(&threshold);
        let closed = std::mem::replace(&mut self.buckets, open);
        self.watermark = Some(self.watermark.map_or(threshold, |w| w.max(threshold)));

        let mut output = FlushOutput::default();
        for (bucket_start, contexts) in closed {
            let mut contexts: Vec<_> = contexts.into_iter().collect();
            contexts.sort_unstable_by_key(|(key, _)| *key);

            for (key, bucket) in contexts {
                self.release_context(key);
                match bucket.value {
                    Aggregate::Sum(value) | Aggregate::Last(value) => {
                        output.series.push(SeriesPoint {
                            name: bucket.name,
                            tags: bucket.tags,
                            kind: bucket.kind,
                            value,
                            timestamp: bucket_start,
                            interval: self.bucket_width,
                            origin: bucket.origin,
                        });
                    }
                    Aggregate::Sketch(sketch) => {
                        output.sketches.push(SketchSeries {
                            name: bucket.name,
                            tags: bucket.tags,
                            kind: bucket.kind,
                            timestamp: bucket_start,
                            interval: self.bucket_width,
                            origin: bucket.origin,
                            sketch: *sketch,
                        });
                    }
                }
            }
        }

        self.stats.flushed_series += output.series.len() as u64;
        self.stats.flushed_sketches += output.sketches.len() as u64;
        debug!(
            cutoff,
            threshold,
            series = output.series.len(),
            sketches = output.sketches.len(),
            open_buckets = self.buckets.len(),
            "Flushed time sampler"
        );
        output
    }

    fn release_context(&mut self, key: ContextKey) {
        self.tags_store.release(key);
        if let Some(refs) = self.contexts.get_mut(&key) {
            *refs -= 1;
            if *refs == 0 {
                self.contexts.remove(&key);
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    /// Start times of the buckets still open, oldest first.
    pub fn open_buckets(&self) -> impl Iterator<Item = i64> + '_ {
        self.buckets.keys().copied()
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn stored_tag_sets(&self) -> usize {
        self.tags_store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
