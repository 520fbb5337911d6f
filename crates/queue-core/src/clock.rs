//! Clock abstraction so time-dependent logic (TTL expiry, claim expiry,
//! windowed counters) never calls the system clock directly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use time::OffsetDateTime;

/// A source of "now". Controllers must only ever read time through this trait.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// The real clock, backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock tests can advance deterministically.
#[derive(Clone)]
pub struct MockClock {
    unix_nanos: Arc<AtomicI64>,
}

impl MockClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            unix_nanos: Arc::new(AtomicI64::new(
                i64::try_from(start.unix_timestamp_nanos()).expect("start time in range"),
            )),
        }
    }

    pub fn advance(&self, duration: time::Duration) {
        self.unix_nanos.fetch_add(
            i64::try_from(duration.whole_nanoseconds()).expect("advance amount in range"),
            Ordering::SeqCst,
        );
    }

    pub fn set(&self, time: OffsetDateTime) {
        self.unix_nanos.store(
            i64::try_from(time.unix_timestamp_nanos()).expect("time in range"),
            Ordering::SeqCst,
        );
    }
}

impl Clock for MockClock {
    fn now(&self) -> OffsetDateTime {
        let nanos = self.unix_nanos.load(Ordering::SeqCst);
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).expect("stored time valid")
    }
}
