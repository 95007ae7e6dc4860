use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub unauthorized: u64,
    pub invalid_requests: u64,
    pub tampered: u64,
    pub rate_limited: u64,
    pub upstream_errors: u64,
    pub internal_errors: u64,
    pub completed: u64,
    pub truncated: u64,
    pub aborted: u64,
    pub content_chunks: u64,
}

#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    unauthorized: AtomicU64,
    invalid_requests: AtomicU64,
    tampered: AtomicU64,
    rate_limited: AtomicU64,
    upstream_errors: AtomicU64,
    internal_errors: AtomicU64,
    completed: AtomicU64,
    truncated: AtomicU64,
    aborted: AtomicU64,
    content_chunks: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_unauthorized(&self) {
        bump(&self.unauthorized);
    }

    pub fn record_invalid_request(&self) {
        bump(&self.invalid_requests);
    }

    pub fn record_tampered(&self) {
        bump(&self.tampered);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited);
    }

    pub fn record_upstream_error(&self) {
        bump(&self.upstream_errors);
    }

    pub fn record_internal_error(&self) {
        bump(&self.internal_errors);
    }

    pub fn record_completed(&self) {
        bump(&self.completed);
    }

    pub fn record_truncated(&self) {
        bump(&self.truncated);
    }

    pub fn record_aborted(&self) {
        bump(&self.aborted);
    }

    pub fn record_content_chunk(&self) {
        bump(&self.content_chunks);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ObservabilitySnapshot {
            requests: load(&self.requests),
            unauthorized: load(&self.unauthorized),
            invalid_requests: load(&self.invalid_requests),
            tampered: load(&self.tampered),
            rate_limited: load(&self.rate_limited),
            upstream_errors: load(&self.upstream_errors),
            internal_errors: load(&self.internal_errors),
            completed: load(&self.completed),
            truncated: load(&self.truncated),
            aborted: load(&self.aborted),
            content_chunks: load(&self.content_chunks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let observability = Observability::default();
        observability.record_request();
        observability.record_request();
        observability.record_rate_limited();
        observability.record_content_chunk();
        observability.record_content_chunk();
        observability.record_content_chunk();
        observability.record_truncated();

        let snapshot = observability.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.content_chunks, 3);
        assert_eq!(snapshot.truncated, 1);
        assert_eq!(snapshot.completed, 0);
    }
}
