#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing the `eventually` package.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Runs a test with a timeout so that a deadlocked future or executor fails the test instead
/// of hanging the test run.
///
/// The timeout is 10 seconds, or 60 seconds under Miri where thread synchronization is slow.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled
/// and the test function is executed directly, so that mutation testing can detect hangs.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode), or re-throws
/// the panic of the test itself.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 2 + 2);
/// assert_eq!(answer, 4);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    with_timeout(timeout, test_fn)
}

/// Like [`with_watchdog`] but with a caller-chosen timeout and no mutation testing bypass.
///
/// # Panics
///
/// Panics if the test exceeds `timeout`, or re-throws the panic of the test itself.
pub fn with_timeout<F, R>(timeout: Duration, test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the watchdog already gave up on us.
        drop(tx.send(result));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded {timeout:?} timeout - a future or executor is likely stuck");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Counts how many threads are inside a region at once and remembers the highest count seen.
///
/// Clones share the same counters. Use [`enter()`](Self::enter) at the start of the region
/// and hold the returned guard until the region ends.
///
/// # Example
///
/// ```rust
/// use testing::ConcurrencyProbe;
///
/// let probe = ConcurrencyProbe::new();
///
/// let first = probe.enter();
/// let second = probe.enter();
/// drop(first);
/// drop(second);
///
/// assert_eq!(probe.peak(), 2);
/// assert_eq!(probe.current(), 0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyProbe {
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    /// Creates a probe with both counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the calling thread as inside the region until the guard is dropped.
    #[must_use]
    pub fn enter(&self) -> ProbeGuard {
        let now_inside = self
            .counters
            .current
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);

        self.counters.peak.fetch_max(now_inside, Ordering::SeqCst);

        ProbeGuard {
            counters: Arc::clone(&self.counters),
        }
    }

    /// How many threads are inside the region right now.
    #[must_use]
    pub fn current(&self) -> usize {
        self.counters.current.load(Ordering::SeqCst)
    }

    /// The highest number of threads that were inside the region at the same time.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

/// Held while a thread is inside a [`ConcurrencyProbe`] region.
#[derive(Debug)]
pub struct ProbeGuard {
    counters: Arc<Counters>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.counters.current.fetch_sub(1, Ordering::SeqCst);
    }
}
