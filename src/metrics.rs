use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessorMetricsSnapshot {
    pub calls_started: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_cancelled: u64,
    pub dispatches: u64,
    pub refresh_attempts: u64,
    pub refresh_failures: u64,
    pub in_flight: u64,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ProcessorMetrics {
    inner: Arc<ProcessorMetricsInner>,
}

#[derive(Debug, Default)]
struct ProcessorMetricsInner {
    calls_started: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    calls_cancelled: AtomicU64,
    dispatches: AtomicU64,
    refresh_attempts: AtomicU64,
    refresh_failures: AtomicU64,
    in_flight: AtomicU64,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

/// Decrements the in-flight gauge when the call task ends, however it ends.
pub(crate) struct InFlightGuard {
    metrics: ProcessorMetrics,
}

impl ProcessorMetrics {
    pub(crate) fn enter_call(&self) -> InFlightGuard {
        self.inner.calls_started.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_dispatch(&self) {
        self.inner.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_attempt(&self) {
        self.inner.refresh_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_failure(&self) {
        self.inner.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.inner.calls_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call_completed<T>(&self, outcome: &Result<T, Error>) {
        match outcome {
            Ok(_) => {
                self.inner.calls_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.inner.calls_failed.fetch_add(1, Ordering::Relaxed);
                let key = match error {
                    Error::HttpStatus { status, .. } | Error::Classified { status, .. } => {
                        format!("{}:{status}", error.code())
                    }
                    Error::Transport { kind, .. } => format!("transport:{kind}"),
                    _ => error.code().as_str().to_owned(),
                };
                self.add_error_count(key);
            }
        }
    }

    fn add_error_count(&self, key: String) {
        let mut counts = lock_unpoisoned(&self.inner.error_counts);
        *counts.entry(key).or_insert(0) += 1;
    }

    pub(crate) fn snapshot(&self) -> ProcessorMetricsSnapshot {
        ProcessorMetricsSnapshot {
            calls_started: self.inner.calls_started.load(Ordering::Relaxed),
            calls_succeeded: self.inner.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.inner.calls_failed.load(Ordering::Relaxed),
            calls_cancelled: self.inner.calls_cancelled.load(Ordering::Relaxed),
            dispatches: self.inner.dispatches.load(Ordering::Relaxed),
            refresh_attempts: self.inner.refresh_attempts.load(Ordering::Relaxed),
            refresh_failures: self.inner.refresh_failures.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics
            .inner
            .in_flight
            .fetch_sub(1, Ordering::Relaxed);
    }
}
