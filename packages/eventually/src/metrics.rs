//! Metrics for futures and the executor.
//!
//! The events are per-thread `nm` instances; runner and worker threads each observe into their own.

use nm::{Event, Magnitude};

/// Histogram buckets for operation execution time in milliseconds.
///
/// Operations are arbitrary caller work, so we expect a wide distribution.
const OPERATION_TIME_MS_BUCKETS: &[Magnitude] = &[0, 1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000];

/// Histogram buckets for the time a dispatched future waits for a concurrency slot.
const SLOT_WAIT_MS_BUCKETS: &[Magnitude] = &[0, 1, 2, 5, 10, 20, 50, 100, 200, 500, 1000];

thread_local! {
    /// How long the operation ran, measured on the runner thread whether or not it won the race.
    pub(crate) static OPERATION_TIME_MS: Event = Event::builder()
        .name("eventually_operation_time_ms")
        .histogram(OPERATION_TIME_MS_BUCKETS)
        .build();

    /// Delay between a future being admitted by the executor and it obtaining a slot.
    pub(crate) static SLOT_WAIT_MS: Event = Event::builder()
        .name("eventually_slot_wait_ms")
        .histogram(SLOT_WAIT_MS_BUCKETS)
        .build();

    pub(crate) static FUTURES_COMPLETED: Event = Event::builder()
        .name("eventually_futures_completed")
        .build();

    pub(crate) static FUTURES_TIMED_OUT: Event = Event::builder()
        .name("eventually_futures_timed_out")
        .build();

    pub(crate) static FUTURES_KILLED: Event = Event::builder()
        .name("eventually_futures_killed")
        .build();
}
