use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, Opts, Registry};

use crate::error::ReceiveResult;
use crate::result::{ResultChangeIds, ResultKey};

const CHANGES_BUCKETS: &[f64] = &[0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0];
const LATENCY_BUCKETS_MS: &[f64] = &[
    10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 15_000.0, 60_000.0, 240_000.0,
];

pub const LATENCY_CREATE_REPLACE: &str = "CREATE_REPLACE";
pub const LATENCY_AUTOCLOSED: &str = "AUTOCLOSED";

/// Push outcome metrics shared by every coordinator in the process.
#[derive(Clone)]
pub struct ReceiveMetrics {
    changes: HistogramVec,
    latency: HistogramVec,
    timeouts: IntCounter,
}

impl ReceiveMetrics {
    pub fn new(registry: &Registry) -> ReceiveResult<Self> {
        let changes = HistogramVec::new(
            HistogramOpts::new(
                "receivecommits_changes",
                "Number of changes uploaded in a single push",
            )
            .buckets(CHANGES_BUCKETS.to_vec()),
            &["type"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "receivecommits_latency",
                "Average processing time in milliseconds per change of a push",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["type"],
        )?;
        let timeouts = IntCounter::with_opts(Opts::new(
            "receivecommits_timeout",
            "Pushes that timed out or failed while processing changes",
        ))?;

        registry.register(Box::new(changes.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;

        Ok(Self {
            changes,
            latency,
            timeouts,
        })
    }

    pub fn record_push(&self, ids: &ResultChangeIds, elapsed: Duration) {
        let (keys, latency_type): (&[ResultKey], &str) = if ids.is_magic_push() {
            (
                &[ResultKey::Created, ResultKey::Replaced],
                LATENCY_CREATE_REPLACE,
            )
        } else {
            (&[ResultKey::Autoclosed], LATENCY_AUTOCLOSED)
        };

        let mut total = 0usize;
        for key in keys {
            let count = ids.count(*key);
            self.changes
                .with_label_values(&[key.as_str()])
                .observe(count as f64);
            total += count;
        }

        if total > 0 {
            let per_change = elapsed.as_secs_f64() * 1_000.0 / total as f64;
            self.latency
                .with_label_values(&[latency_type])
                .observe(per_change);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.inc();
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.get()
    }

    pub fn changes_histogram(&self, key: ResultKey) -> prometheus::Histogram {
        self.changes.with_label_values(&[key.as_str()])
    }

    pub fn latency_histogram(&self, latency_type: &str) -> prometheus::Histogram {
        self.latency.with_label_values(&[latency_type])
    }
}
