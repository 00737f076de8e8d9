//! Injectable time source

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of "now" timestamps, in nanoseconds since the Unix epoch.
///
/// The store reads every timestamp through its clock, which makes
/// time-dependent behavior (record ordering, age-based sweeps) fully
/// deterministic under test.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> u64 + Send + Sync>);

impl Clock {
    /// The wall clock.
    #[must_use]
    pub fn system() -> Self {
        Self(Arc::new(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        }))
    }

    /// A clock built from an arbitrary closure.
    pub fn from_fn(f: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Current time in nanoseconds since the Unix epoch.
    #[must_use]
    pub fn now_ns(&self) -> u64 {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Clock(..)")
    }
}

/// A manually driven clock for tests.
///
/// Every call to [`ManualClock::tick`] advances time, so sequentially
/// inserted records get strictly increasing timestamps.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now_ns: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a manual clock starting at the given timestamp.
    #[must_use]
    pub fn starting_at(now_ns: u64) -> Self {
        Self {
            now_ns: Arc::new(AtomicU64::new(now_ns)),
        }
    }

    /// Advance the clock by `delta_ns` nanoseconds.
    pub fn advance(&self, delta_ns: u64) {
        self.now_ns.fetch_add(delta_ns, Ordering::SeqCst);
    }

    /// Set the clock to an absolute timestamp.
    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }

    /// Advance by one nanosecond and return the previous value.
    pub fn tick(&self) -> u64 {
        self.now_ns.fetch_add(1, Ordering::SeqCst)
    }

    /// Current value without advancing.
    #[must_use]
    pub fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    /// A [`Clock`] view that advances on every read.
    #[must_use]
    pub fn clock(&self) -> Clock {
        let inner = Arc::clone(&self.now_ns);
        Clock::from_fn(move || inner.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(1_700_000_000_000_000_000)
    }
}
