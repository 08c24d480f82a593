use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

/// A source of wall-clock time in whole seconds since the UNIX epoch.
///
/// Token expiry is expressed in the same unit, so the codec only ever compares
/// two values produced by the same source. Tests plug in a [`ManualClock`].
///
/// # Example
///
/// ```
/// use grin_account_core::token::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn now_secs(&self) -> i64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.now_secs(), 1234);
/// ```
pub trait TimeSource: Send + Sync {
    /// Returns the current time in seconds since the UNIX epoch.
    fn now_secs(&self) -> i64;
}

/// The process wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying instant, so a test can hand one clone to
/// a codec and keep another to advance time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_secs: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_secs)),
        }
    }

    /// Starts the clock at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now_secs())
    }

    pub fn advance(&self, by: Duration) {
        let secs = i64::try_from(by.as_secs()).unwrap_or(i64::MAX);
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: i64) {
        self.now.store(secs, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_secs(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
