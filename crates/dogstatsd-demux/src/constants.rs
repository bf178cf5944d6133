// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Number of pooled sample batches, also the capacity of the worker queue.
pub const DEFAULT_AGGREGATOR_BUFFER_SIZE: usize = 100;

/// Samples per pooled batch.
pub const DEFAULT_SAMPLE_BATCH_SIZE: usize = 32;

/// Width of an aggregation bucket, in seconds.
pub const DEFAULT_BUCKET_WIDTH_SECS: i64 = 10;

pub const DEFAULT_GRACE_PERIOD_SECS: i64 = 0;

/// Upper bound accepted for the grace period.
pub const MAX_GRACE_PERIOD_SECS: i64 = 3600;

pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 15;

/// Maximum number of distinct contexts tracked by the sampler.
pub const DEFAULT_MAX_CONTEXTS: usize = 10_240;

/// Capacity of the channel between the worker and the series consumer.
pub const DEFAULT_FLUSH_SERIES_CHANNEL_SIZE: usize = 200;

/// Number of points the series consumer hands to the writer at once.
pub const DEFAULT_FLUSH_SERIES_BUFFER_SIZE: usize = 4_000;

pub const DEFAULT_MAX_SERIES_PER_PAYLOAD: usize = 10_000;

/// Maximum number of tags accepted on a single sample.
pub const MAX_TAGS: usize = 100;

pub const SERIES_ENDPOINT: &str = "/api/v2/series";
pub const SKETCHES_ENDPOINT: &str = "/api/beta/sketches";
