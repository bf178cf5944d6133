// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric samples as they travel from producers to the sampler.

use crate::constants;
use crate::errors::ParseError;
use derive_more::Display;
use fnv::FnvHasher;
use std::hash::{Hash, Hasher};
use std::time::UNIX_EPOCH;
use ustr::Ustr;

/// Identity of a metric context: a hash over the name and the sorted tags.
pub type ContextKey = u64;

pub const EMPTY_TAGS: SortedTags = SortedTags { values: Vec::new() };

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum MetricKind {
    #[display("count")]
    Count,
    #[display("rate")]
    Rate,
    #[display("gauge")]
    Gauge,
    #[display("histogram")]
    Histogram,
    #[display("distribution")]
    Distribution,
}

impl MetricKind {
    /// Kinds that are summarized into a sketch rather than a single point.
    #[must_use]
    pub const fn is_sketch(self) -> bool {
        matches!(self, Self::Histogram | Self::Distribution)
    }
}

/// Tags sorted and deduplicated so that equal tag sets hash equally.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SortedTags {
    values: Vec<(Ustr, Ustr)>,
}

impl SortedTags {
    /// Parses a comma separated tag section such as `env:prod,service:web`.
    pub fn parse(tags_section: &str) -> Result<Self, ParseError> {
        let mut parsed_tags = Vec::with_capacity(8);
        for part in tags_section.split(',').filter(|s| !s.is_empty()) {
            match part.split_once(':') {
                Some((key, value)) => parsed_tags.push((Ustr::from(key), Ustr::from(value))),
                None => parsed_tags.push((Ustr::from(part), Ustr::from(""))),
            }
        }

        parsed_tags.sort_unstable();
        parsed_tags.dedup();

        if parsed_tags.len() > constants::MAX_TAGS {
            return Err(ParseError::Raw(format!(
                "Too many tags, more than {c}",
                c = constants::MAX_TAGS
            )));
        }

        Ok(Self {
            values: parsed_tags,
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Renders tags back into their `key:value` form.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.to_string()
                } else {
                    format!("{key}:{value}")
                }
            })
            .collect()
    }
}

#[must_use]
pub fn context_key(name: Ustr, tags: &SortedTags) -> ContextKey {
    let mut hasher = FnvHasher::default();
    name.as_str().hash(&mut hasher);
    tags.hash(&mut hasher);
    hasher.finish()
}

/// A single observation. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub name: Ustr,
    pub value: f64,
    pub kind: MetricKind,
    pub tags: SortedTags,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    pub origin: Option<Ustr>,
    pub context: ContextKey,
}

impl MetricSample {
    #[must_use]
    pub fn new(name: &str, value: f64, kind: MetricKind, tags: SortedTags, timestamp: i64) -> Self {
        let name = Ustr::from(name);
        let context = context_key(name, &tags);
        Self {
            name,
            value,
            kind,
            tags,
            timestamp,
            origin: None,
            context,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(Ustr::from(origin));
        self
    }
}

/// Current unix time in seconds.
#[must_use]
pub fn now() -> i64 {
    UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or_default()
        .try_into()
        .unwrap_or_default()
}

/// Parses a DogStatsD line, stamping it with the current time if it carries
/// no `T` timestamp.
pub fn parse(input: &str) -> Result<MetricSample, ParseError> {
    parse_at(input, now())
}

/// Parses `<name>:<value>|<type>[|@<rate>][|#<tags>][|T<ts>][|c:<origin>]`.
pub fn parse_at(input: &str, default_timestamp: i64) -> Result<MetricSample, ParseError> {
    let mut sections = input.trim().split('|');

    let head = sections
        .next()
        .ok_or_else(|| ParseError::Raw(format!("empty metric: {input}")))?;
    let (name, raw_value) = head
        .rsplit_once(':')
        .ok_or_else(|| ParseError::Raw(format!("missing value in {input}")))?;
    if name.is_empty() {
        return Err(ParseError::Raw(format!("missing name in {input}")));
    }
    let mut value: f64 = raw_value
        .parse()
        .map_err(|_| ParseError::Raw(format!("invalid value {raw_value}")))?;

    let kind = match sections.next() {
        Some("c") => MetricKind::Count,
        Some("g") => MetricKind::Gauge,
        Some("h") | Some("ms") => MetricKind::Histogram,
        Some("d") => MetricKind::Distribution,
        Some(other) => return Err(ParseError::UnsupportedType(other.to_string())),
        None => return Err(ParseError::Raw(format!("missing type in {input}"))),
    };

    let mut tags = EMPTY_TAGS;
    let mut timestamp = default_timestamp;
    let mut origin = None;
    for section in sections {
        if let Some(rate) = section.strip_prefix('@') {
            let rate: f64 = rate
                .parse()
                .map_err(|_| ParseError::Raw(format!("invalid sample rate {rate}")))?;
            // Only counts are scaled; other kinds keep the observed value.
            if kind == MetricKind::Count && rate > 0.0 && rate <= 1.0 {
                value /= rate;
            }
        } else if let Some(raw_tags) = section.strip_prefix('#') {
            tags = SortedTags::parse(raw_tags)?;
        } else if let Some(ts) = section.strip_prefix('T') {
            timestamp = ts
                .parse()
                .map_err(|_| ParseError::Raw(format!("invalid timestamp {ts}")))?;
        } else if let Some(raw_origin) = section.strip_prefix("c:") {
            origin = Some(raw_origin);
        }
    }

    let sample = MetricSample::new(name, value, kind, tags, timestamp);
    Ok(match origin {
        Some(origin) => sample.with_origin(origin),
        None => sample,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sorted_tags_parse_sorts_and_dedups() {
        let tags = SortedTags::parse("service:web,env:prod,env:prod,debug").unwrap();
        assert_eq!(tags.len(), 3);
        assert_eq!(
            tags.to_strings(),
            vec!["debug".to_string(), "env:prod".to_string(), "service:web".to_string()]
        );
    }

    #[test]
    fn test_sorted_tags_too_many() {
        let raw = (0..=constants::MAX_TAGS)
            .map(|i| format!("k{i}:v"))
            .collect::<Vec<_>>()
            .join(",");
        assert!(SortedTags::parse(&raw).is_err());
    }

    #[test]
    fn test_context_key_ignores_tag_order() {
        let a = MetricSample::new(
            "requests",
            1.0,
            MetricKind::Count,
            SortedTags::parse("env:prod,service:web").unwrap(),
            0,
        );
        let b = MetricSample::new(
            "requests",
            2.0,
            MetricKind::Gauge,
            SortedTags::parse("service:web,env:prod").unwrap(),
            50,
        );
        assert_eq!(a.context, b.context);

        let c = MetricSample::new("requests", 1.0, MetricKind::Count, EMPTY_TAGS, 0);
        assert_ne!(a.context, c.context);
    }

    #[test]
    fn test_parse_count_with_tags_and_timestamp() {
        let sample = parse_at("page.views:3|c|#env:prod|T1656581409", 0).unwrap();
        assert_eq!(sample.name.as_str(), "page.views");
        assert_eq!(sample.value, 3.0);
        assert_eq!(sample.kind, MetricKind::Count);
        assert_eq!(sample.timestamp, 1_656_581_409);
        assert_eq!(sample.tags.to_strings(), vec!["env:prod".to_string()]);
    }

    #[test]
    fn test_parse_defaults_timestamp() {
        let sample = parse_at("queue.depth:12.5|g", 1_000).unwrap();
        assert_eq!(sample.kind, MetricKind::Gauge);
        assert_eq!(sample.timestamp, 1_000);
        assert!(sample.tags.is_empty());
    }

    #[test]
    fn test_parse_sample_rate_scales_counts() {
        let sample = parse_at("hits:1|c|@0.5", 0).unwrap();
        assert_eq!(sample.value, 2.0);

        let sample = parse_at("latency:1|d|@0.5", 0).unwrap();
        assert_eq!(sample.value, 1.0);
    }

    #[test]
    fn test_parse_origin() {
        let sample = parse_at("hits:1|c|c:ci-1234", 0).unwrap();
        assert_eq!(sample.origin, Some(Ustr::from("ci-1234")));
    }

    #[test]
    fn test_parse_kinds() {
        assert_eq!(parse_at("a:1|h", 0).unwrap().kind, MetricKind::Histogram);
        assert_eq!(parse_at("a:1|ms", 0).unwrap().kind, MetricKind::Histogram);
        assert_eq!(parse_at("a:1|d", 0).unwrap().kind, MetricKind::Distribution);
        assert_eq!(
            parse_at("a:1|s", 0),
            Err(ParseError::UnsupportedType("s".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_at("no-value", 0).is_err());
        assert!(parse_at(":1|c", 0).is_err());
        assert!(parse_at("a:x|c", 0).is_err());
        assert!(parse_at("a:1", 0).is_err());
        assert!(parse_at("a:1|c|Tnope", 0).is_err());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MetricKind::Distribution.to_string(), "distribution");
        assert!(MetricKind::Histogram.is_sketch());
        assert!(!MetricKind::Rate.is_sketch());
    }

    proptest! {
        #[test]
        fn test_parse_never_panics(line in "\\PC*") {
            let _ = parse_at(&line, 0);
        }
    }
}
