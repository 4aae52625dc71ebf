use std::sync::{
    OnceLock,
    atomic::{AtomicU64, Ordering},
};

use schema::ErrorClass;
use serde::Serialize;

static COUNTERS: OnceLock<IngestCounters> = OnceLock::new();

/// Process-wide commit outcome counters.
///
/// Nothing is counted until [`install`] runs, so library users and tests that
/// never install see no shared state.
#[derive(Debug, Default)]
pub struct IngestCounters {
    admitted_total: AtomicU64,
    duplicate_total: AtomicU64,
    invalid_total: AtomicU64,
    rejected_total: AtomicU64,
    infrastructure_error_total: AtomicU64,
    notify_failure_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub admitted_total: u64,
    pub duplicate_total: u64,
    pub invalid_total: u64,
    pub rejected_total: u64,
    pub infrastructure_error_total: u64,
    pub notify_failure_total: u64,
}

impl IngestCounters {
    pub fn observe_admitted(&self, notified: bool) {
        self.admitted_total.fetch_add(1, Ordering::Relaxed);
        if !notified {
            self.notify_failure_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn observe_failure(&self, class: ErrorClass) {
        let counter = match class {
            ErrorClass::Duplicate => &self.duplicate_total,
            ErrorClass::Validation => &self.invalid_total,
            ErrorClass::UploadRejected | ErrorClass::InvalidPath | ErrorClass::NotFound => {
                &self.rejected_total
            }
            ErrorClass::Infrastructure => &self.infrastructure_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            admitted_total: self.admitted_total.load(Ordering::Relaxed),
            duplicate_total: self.duplicate_total.load(Ordering::Relaxed),
            invalid_total: self.invalid_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            infrastructure_error_total: self.infrastructure_error_total.load(Ordering::Relaxed),
            notify_failure_total: self.notify_failure_total.load(Ordering::Relaxed),
        }
    }
}

/// Registers the process-wide counters. Idempotent.
pub fn install() -> &'static IngestCounters {
    COUNTERS.get_or_init(IngestCounters::default)
}

pub fn installed() -> Option<&'static IngestCounters> {
    COUNTERS.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_bucketed_by_class() {
        let counters = IngestCounters::default();
        counters.observe_admitted(true);
        counters.observe_admitted(false);
        counters.observe_failure(ErrorClass::Duplicate);
        counters.observe_failure(ErrorClass::Validation);
        counters.observe_failure(ErrorClass::UploadRejected);
        counters.observe_failure(ErrorClass::Infrastructure);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.admitted_total, 2);
        assert_eq!(snapshot.notify_failure_total, 1);
        assert_eq!(snapshot.duplicate_total, 1);
        assert_eq!(snapshot.invalid_total, 1);
        assert_eq!(snapshot.rejected_total, 1);
        assert_eq!(snapshot.infrastructure_error_total, 1);
    }

    #[test]
    fn install_returns_the_same_instance() {
        let first = install() as *const IngestCounters;
        let second = install() as *const IngestCounters;
        assert_eq!(first, second);
        assert!(installed().is_some());
    }
}
