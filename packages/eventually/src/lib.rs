#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Time-bounded, cancellable futures and a bounded-concurrency executor that streams their
//! completions.
//!
//! A [`TimedFuture`] wraps one blocking [`Operation`] with a timeout. Once started, the
//! operation races against the timer and against [`TimedFuture::kill()`]; exactly one of them
//! decides the outcome and the other two are ignored.
//!
//! An [`Executor`] runs submitted futures with a fixed upper bound on how many run at once and
//! publishes each one on an output stream after it resolves.
//!
//! # Futures
//!
//! ```rust
//! use std::time::Duration;
//!
//! use eventually::TimedFuture;
//!
//! let future = TimedFuture::<_, String>::new(|| Ok("done"), Duration::from_secs(1));
//!
//! // Start the race and wait for the outcome.
//! assert_eq!(future.await_result(), Ok(&"done"));
//!
//! // The outcome never changes and can be read any number of times.
//! assert_eq!(future.get(), Ok(&"done"));
//!
//! // Killing a future that already completed reports that it was not killed.
//! assert!(!future.kill());
//! ```
//!
//! # Executor
//!
//! ```rust
//! use std::time::Duration;
//!
//! use eventually::{Executor, GetError, TimedFuture};
//! use new_zealand::nz;
//!
//! let executor = Executor::<u64, String>::new(nz!(4), true);
//!
//! for i in 0..10 {
//!     let future = TimedFuture::new(
//!         move || {
//!             std::thread::sleep(Duration::from_millis(10));
//!             Ok(i)
//!         },
//!         Duration::from_secs(1),
//!     );
//!     assert!(executor.execute(future));
//! }
//!
//! // Wait for the first four to finish, in whatever order they resolve.
//! let finished = executor.get(4, Duration::from_secs(5)).unwrap();
//! assert_eq!(finished.len(), 4);
//!
//! // Asking for more than will ever arrive times out, keeping what was collected.
//! match executor.get(100, Duration::from_millis(500)) {
//!     Err(GetError::TimedOut { collected, .. }) => assert_eq!(collected.len(), 6),
//!     other => panic!("unexpected: {other:?}"),
//! }
//!
//! executor.stop().unwrap();
//! assert!(executor.stop().is_err());
//! ```
//!
//! # Errors
//!
//! Outcomes produced by this crate are distinguished by kind, never by message:
//!
//! * [`FutureError::TimedOut`], [`FutureError::Killed`] and [`FutureError::Panicked`] for
//!   futures, with [`FutureError::Failed`] carrying the operation's own error.
//! * [`GetError`] when [`Executor::get()`] cannot collect enough futures.
//! * [`AlreadyStopped`] when [`Executor::stop()`] is called twice.
//!
//! Submitting to a stopped executor is an expected condition and is reported by
//! [`Executor::execute()`] returning `false`.
//!
//! # Cancellation
//!
//! Operations are plain closures with no cancellation hook. A timed out or killed future stops
//! waiting for its operation, but the operation keeps running on its own thread until it
//! returns, and its result is then discarded. Operations that may run for a long time should
//! watch for cancellation themselves.
//!
//! # Observability
//!
//! The crate logs through `tracing` and records `nm` metrics (operation duration, slot wait
//! time and per-outcome counts). It never installs a subscriber or reporter.

mod error;
mod executor;
mod future;
mod metrics;
mod slots;

pub use error::*;
pub use executor::*;
pub use future::*;
