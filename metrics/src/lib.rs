use std::time::{Duration, Instant};

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into `metric` when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &[KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: labels.to_vec(),
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}

pub mod storage {
    use opentelemetry::{
        metrics::{Counter, Histogram},
        KeyValue,
    };

    #[derive(Debug)]
    pub struct Metrics {
        backend: &'static str,
        pub operations: Histogram<f64>,
        pub degraded_reads: Counter<u64>,
        pub nar_bytes_uploaded: Counter<u64>,
    }

    impl Metrics {
        pub fn new(backend: &'static str) -> Metrics {
            let meter = opentelemetry::global::meter("opencache-storage");

            let operations = meter
                .f64_histogram("opencache.storage.operations")
                .with_description("storage backend operation latencies in seconds")
                .build();

            let degraded_reads = meter
                .u64_counter("opencache.storage.degraded_reads")
                .with_description("reads reported as absent because the remote lookup failed")
                .build();

            let nar_bytes_uploaded = meter
                .u64_counter("opencache.storage.nar_bytes_uploaded")
                .with_description("number of NAR bytes uploaded")
                .build();

            Metrics {
                backend,
                operations,
                degraded_reads,
                nar_bytes_uploaded,
            }
        }

        pub fn labels(&self, operation: &'static str) -> [KeyValue; 2] {
            [
                KeyValue::new("backend", self.backend),
                KeyValue::new("operation", operation),
            ]
        }
    }
}
