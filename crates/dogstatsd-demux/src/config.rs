// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants;
use crate::errors::Error;
use crate::pool::ExhaustionPolicy;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use tracing::warn;

/// Configuration of the demultiplexer and its aggregation pipeline
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Number of pooled sample batches, also the capacity of the worker queue
    pub aggregator_buffer_size: usize,
    /// Samples per pooled batch
    pub metric_sample_batch_size: usize,
    /// Share tag sets across the buckets of one context
    pub aggregator_use_tags_store: bool,
    /// Log every series and sketch that is flushed
    pub log_payloads: bool,
    pub bucket_width_secs: i64,
    /// How long a bucket stays open after its end to accept late samples
    pub grace_period_secs: i64,
    pub flush_interval_secs: u64,
    pub aggregator_max_contexts: usize,
    pub pool_exhaustion: ExhaustionPolicy,
    /// Capacity of the channel between the worker and the series consumer
    pub flush_series_channel_size: usize,
    /// Series handed to the serializer at once
    pub flush_series_buffer_size: usize,
    pub max_series_per_payload: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            aggregator_buffer_size: constants::DEFAULT_AGGREGATOR_BUFFER_SIZE,
            metric_sample_batch_size: constants::DEFAULT_SAMPLE_BATCH_SIZE,
            aggregator_use_tags_store: true,
            log_payloads: false,
            bucket_width_secs: constants::DEFAULT_BUCKET_WIDTH_SECS,
            grace_period_secs: constants::DEFAULT_GRACE_PERIOD_SECS,
            flush_interval_secs: constants::DEFAULT_FLUSH_INTERVAL_SECS,
            aggregator_max_contexts: constants::DEFAULT_MAX_CONTEXTS,
            pool_exhaustion: ExhaustionPolicy::default(),
            flush_series_channel_size: constants::DEFAULT_FLUSH_SERIES_CHANNEL_SIZE,
            flush_series_buffer_size: constants::DEFAULT_FLUSH_SERIES_BUFFER_SIZE,
            max_series_per_payload: constants::DEFAULT_MAX_SERIES_PER_PAYLOAD,
        }
    }
}

fn parse_or<T: FromStr + Copy>(raw: Option<String>, var: &str, default: T) -> T {
    match raw {
        Some(val) => val.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("Ignoring invalid value '{val}' for {var}");
            default
        }),
        None => default,
    }
}

fn parse_bool(raw: Option<String>, default: bool) -> bool {
    raw.map(|val| match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        _ => default,
    })
    .unwrap_or(default)
}

impl AggregatorConfig {
    /// Create configuration from `DD_*` environment variables
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let pool_exhaustion = match var("DD_AGGREGATOR_POOL_EXHAUSTION") {
            Some(val) => val.parse::<ExhaustionPolicy>()?,
            None => defaults.pool_exhaustion,
        };

        let config = Self {
            aggregator_buffer_size: parse_or(
                var("DD_AGGREGATOR_BUFFER_SIZE"),
                "DD_AGGREGATOR_BUFFER_SIZE",
                defaults.aggregator_buffer_size,
            ),
            metric_sample_batch_size: parse_or(
                var("DD_METRIC_SAMPLE_BATCH_SIZE"),
                "DD_METRIC_SAMPLE_BATCH_SIZE",
                defaults.metric_sample_batch_size,
            ),
            aggregator_use_tags_store: parse_bool(
                var("DD_AGGREGATOR_USE_TAGS_STORE"),
                defaults.aggregator_use_tags_store,
            ),
            log_payloads: parse_bool(var("DD_LOG_PAYLOADS"), defaults.log_payloads),
            bucket_width_secs: parse_or(
                var("DD_AGGREGATOR_BUCKET_WIDTH"),
                "DD_AGGREGATOR_BUCKET_WIDTH",
                defaults.bucket_width_secs,
            ),
            grace_period_secs: parse_or(
                var("DD_AGGREGATOR_GRACE_PERIOD"),
                "DD_AGGREGATOR_GRACE_PERIOD",
                defaults.grace_period_secs,
            ),
            flush_interval_secs: parse_or(
                var("DD_AGGREGATOR_FLUSH_INTERVAL"),
                "DD_AGGREGATOR_FLUSH_INTERVAL",
                defaults.flush_interval_secs,
            ),
            aggregator_max_contexts: parse_or(
                var("DD_AGGREGATOR_MAX_CONTEXTS"),
                "DD_AGGREGATOR_MAX_CONTEXTS",
                defaults.aggregator_max_contexts,
            ),
            pool_exhaustion,
            flush_series_channel_size: parse_or(
                var("DD_AGGREGATOR_FLUSH_CHAN_SIZE"),
                "DD_AGGREGATOR_FLUSH_CHAN_SIZE",
                defaults.flush_series_channel_size,
            ),
            flush_series_buffer_size: parse_or(
                var("DD_AGGREGATOR_FLUSH_BUFFER_SIZE"),
                "DD_AGGREGATOR_FLUSH_BUFFER_SIZE",
                defaults.flush_series_buffer_size,
            ),
            max_series_per_payload: parse_or(
                var("DD_SERIALIZER_MAX_SERIES_PER_PAYLOAD"),
                "DD_SERIALIZER_MAX_SERIES_PER_PAYLOAD",
                defaults.max_series_per_payload,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Error> {
        let sizes = [
            ("aggregator_buffer_size", self.aggregator_buffer_size),
            ("metric_sample_batch_size", self.metric_sample_batch_size),
            ("aggregator_max_contexts", self.aggregator_max_contexts),
            ("flush_series_channel_size", self.flush_series_channel_size),
            ("flush_series_buffer_size", self.flush_series_buffer_size),
            ("max_series_per_payload", self.max_series_per_payload),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.bucket_width_secs <= 0 {
            return Err(Error::InvalidConfig(
                "bucket_width_secs must be greater than 0".to_string(),
            ));
        }

        if self.flush_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "flush_interval_secs must be greater than 0".to_string(),
            ));
        }

        if !(0..constants::MAX_GRACE_PERIOD_SECS).contains(&self.grace_period_secs) {
            return Err(Error::InvalidConfig(format!(
                "grace_period_secs must be between 0 and {}, got {}",
                constants::MAX_GRACE_PERIOD_SECS,
                self.grace_period_secs
            )));
        }

        Ok(())
    }
}
