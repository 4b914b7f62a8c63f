//! Derived statistics over a set of observations.
//!
//! Everything here is a pure function of its input slice: no I/O, no shared
//! state, and no failure mode. Empty input produces zero-valued results.

use crate::observation_store::Observation;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Timelike};
use serde::Serialize;
use std::collections::HashMap;

/// Summary statistics across a set of observations
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryStats {
    /// Number of observations
    pub count: u64,
    /// Sum of all sizes in bytes, saturating at `u64::MAX`
    pub total_bytes: u64,
    /// Mean size in bytes
    pub average_bytes: f64,
    /// Smallest size in bytes
    pub min_bytes: u64,
    /// Largest size in bytes
    pub max_bytes: u64,
    /// Latest timestamp in the set
    pub most_recent_timestamp: Option<DateTime<FixedOffset>>,
}

/// Observations aggregated into one clock hour
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourBucket {
    /// Start of the hour, in the offset the observations carried
    pub hour_start: DateTime<FixedOffset>,
    /// Number of observations in the hour
    pub count: u64,
    /// Sum of sizes in the hour, saturating at `u64::MAX`
    pub total_bytes: u64,
}

/// Half-open size range `[min, max)`; `max = None` is unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    pub label: &'static str,
    pub min: u64,
    pub max: Option<u64>,
}

impl SizeRange {
    /// Whether `size` falls inside this range
    pub fn contains(&self, size: u64) -> bool {
        size >= self.min && self.max.map_or(true, |max| size < max)
    }
}

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// Fixed size ranges, in classification order
pub const SIZE_RANGES: [SizeRange; 6] = [
    SizeRange {
        label: "< 1KB",
        min: 0,
        max: Some(KB),
    },
    SizeRange {
        label: "1KB - 10KB",
        min: KB,
        max: Some(10 * KB),
    },
    SizeRange {
        label: "10KB - 100KB",
        min: 10 * KB,
        max: Some(100 * KB),
    },
    SizeRange {
        label: "100KB - 1MB",
        min: 100 * KB,
        max: Some(MB),
    },
    SizeRange {
        label: "1MB - 10MB",
        min: MB,
        max: Some(10 * MB),
    },
    SizeRange {
        label: "> 10MB",
        min: 10 * MB,
        max: None,
    },
];

/// Observation count for one size range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeRangeBucket {
    /// Human-readable range, e.g. `1KB - 10KB`
    pub range_label: &'static str,
    /// Observations classified into the range
    pub count: u64,
    /// Share of all observations, 0-100
    pub percentage: f64,
}

/// Compute count, total, mean, extremes and latest timestamp
///
/// A total that would overflow `u64` is clamped to `u64::MAX`; the average is
/// then computed from the clamped total.
pub fn summarize(observations: &[Observation]) -> SummaryStats {
    let Some(first) = observations.first() else {
        return SummaryStats::default();
    };

    let mut stats = SummaryStats {
        count: 0,
        total_bytes: 0,
        average_bytes: 0.0,
        min_bytes: first.size_bytes,
        max_bytes: first.size_bytes,
        most_recent_timestamp: Some(first.timestamp),
    };

    for observation in observations {
        stats.count += 1;
        stats.total_bytes = stats.total_bytes.saturating_add(observation.size_bytes);
        // strict comparisons keep the first occurrence on ties
        if observation.size_bytes < stats.min_bytes {
            stats.min_bytes = observation.size_bytes;
        }
        if observation.size_bytes > stats.max_bytes {
            stats.max_bytes = observation.size_bytes;
        }
        if stats
            .most_recent_timestamp
            .map_or(true, |latest| observation.timestamp > latest)
        {
            stats.most_recent_timestamp = Some(observation.timestamp);
        }
    }

    stats.average_bytes = stats.total_bytes as f64 / stats.count as f64;
    stats
}

/// Truncate a timestamp to the start of its hour, keeping its offset
pub fn truncate_to_hour(timestamp: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    timestamp
        .with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_minute(0))
        .unwrap_or(timestamp)
}

/// Group observations by the clock hour they fall in
///
/// Only hours holding at least one observation are emitted. The output order
/// is unspecified; use [`sort_hour_buckets`] when callers need it ordered.
/// Observations merge when both the local hour and the offset match.
pub fn bucket_by_hour(observations: &[Observation]) -> Vec<HourBucket> {
    let mut hours: HashMap<(NaiveDateTime, FixedOffset), HourBucket> = HashMap::new();

    for observation in observations {
        let hour_start = truncate_to_hour(observation.timestamp);
        let bucket = hours
            .entry((hour_start.naive_local(), *hour_start.offset()))
            .or_insert(HourBucket {
                hour_start,
                count: 0,
                total_bytes: 0,
            });
        bucket.count += 1;
        bucket.total_bytes = bucket.total_bytes.saturating_add(observation.size_bytes);
    }

    hours.into_values().collect()
}

/// Sort hour buckets by ascending `hour_start`
pub fn sort_hour_buckets(buckets: &mut [HourBucket]) {
    buckets.sort_by_key(|b| b.hour_start);
}

/// Count observations per fixed size range
///
/// Every range in [`SIZE_RANGES`] is emitted, in order, even when empty.
pub fn size_distribution(observations: &[Observation]) -> Vec<SizeRangeBucket> {
    let mut counts = [0u64; SIZE_RANGES.len()];

    for observation in observations {
        if let Some(index) = SIZE_RANGES
            .iter()
            .position(|range| range.contains(observation.size_bytes))
        {
            counts[index] += 1;
        }
    }

    let total = observations.len() as f64;

    SIZE_RANGES
        .iter()
        .zip(counts)
        .map(|(range, count)| SizeRangeBucket {
            range_label: range.label,
            count,
            percentage: if total > 0.0 {
                count as f64 / total * 100.0
            } else {
                0.0
            },
        })
        .collect()
}
