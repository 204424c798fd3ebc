//! Bounded-concurrency execution of [`TimedFuture`]s.

use std::any::type_name;
use std::borrow::Cow;
use std::fmt;
use std::num::NonZero;
use std::panic;
use std::sync::Arc;
use std::thread::{self, JoinHandle as ThreadJoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvError, RecvTimeoutError, SendError, Sender};
use new_zealand::nz;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::metrics::SLOT_WAIT_MS;
use crate::slots::Slots;
use crate::{AlreadyStopped, GetError, TimedFuture};

const DEFAULT_MAX_CONCURRENCY: NonZero<usize> = nz!(4);

const DEFAULT_THREAD_NAME_PREFIX: &str = "eventually";

/// Channels that only exist while the executor is started and not yet stopped.
struct Active<T, E> {
    // Zero-capacity: a submission completes only when the dispatch loop takes it.
    admission: Sender<TimedFuture<T, E>>,

    // Never sent on. Dropping it disconnects the receiver, which is the shutdown broadcast.
    shutdown: Sender<()>,

    dispatcher: ThreadJoinHandle<()>,
}

struct Lifecycle<T, E> {
    started: bool,
    stopped: bool,

    // The executor's own end of the output stream. Handed to the workers on start,
    // dropped directly if the executor is stopped without ever starting.
    output: Option<Sender<TimedFuture<T, E>>>,

    active: Option<Active<T, E>>,
}

/// Runs submitted [`TimedFuture`]s with at most `max_concurrency` of them executing at once,
/// publishing each one on an output stream after it resolves.
///
/// # Lifecycle
///
/// An executor is created either started or not (see [`Executor::new()`] and
/// [`ExecutorBuilder::start()`]). It can be started once and stopped once; a stopped executor
/// never starts again.
///
/// # Submission
///
/// [`execute()`](Self::execute) hands a future to the dispatch loop without buffering, so a
/// submitter blocks until the loop accepts it. The loop queues accepted futures for a fixed set
/// of `max_concurrency` worker threads. A worker takes a concurrency slot, runs the future,
/// releases the slot and then publishes the future on the stream returned by
/// [`listen()`](Self::listen). Publication order follows resolution order, not submission order.
///
/// # Shutdown
///
/// [`stop()`](Self::stop) stops accepting work. Futures already accepted are not cancelled:
/// they still run and are still published. The output stream disconnects only after the last
/// of them has been published.
///
/// Dropping a started executor stops it.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use eventually::{Executor, TimedFuture};
/// use new_zealand::nz;
///
/// let executor = Executor::<u32, String>::new(nz!(2), true);
///
/// for i in 0..3 {
///     let future = TimedFuture::new(move || Ok(i * 10), Duration::from_secs(1));
///     assert!(executor.execute(future));
/// }
///
/// let finished = executor.get(3, Duration::from_secs(5)).unwrap();
/// let mut values: Vec<u32> = finished.iter().map(|f| *f.get().unwrap()).collect();
/// values.sort_unstable();
/// assert_eq!(values, vec![0, 10, 20]);
///
/// executor.stop().unwrap();
/// ```
pub struct Executor<T, E> {
    slots: Arc<Slots>,
    thread_name_prefix: Cow<'static, str>,
    lifecycle: Mutex<Lifecycle<T, E>>,
    listener: Receiver<TimedFuture<T, E>>,
}

impl<T, E> Executor<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates an executor that runs up to `max_concurrency` futures at once, optionally
    /// starting it right away.
    ///
    /// Use [`Executor::builder()`] for further configuration.
    #[must_use]
    pub fn new(max_concurrency: NonZero<usize>, start: bool) -> Self {
        Self::builder()
            .max_concurrency(max_concurrency)
            .start(start)
            .build()
    }

    /// Creates a builder for configuring an executor.
    #[must_use]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::new()
    }

    /// Starts the dispatch loop. Returns `true` if this call started the executor.
    ///
    /// Returns `false` without effect if the executor was already started or has been stopped.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn the dispatch thread or a worker thread.
    pub fn start(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();

        if lifecycle.started || lifecycle.stopped {
            return false;
        }

        let output = lifecycle
            .output
            .take()
            .expect("an executor that was never started still owns its output sender");

        let (admission, admission_rx) = channel::bounded(0);
        let (shutdown, shutdown_rx) = channel::bounded(0);
        let (queue, queue_rx) = channel::unbounded();

        for index in 0..self.slots.capacity().get() {
            let worker = Worker {
                queue: queue_rx.clone(),
                output: output.clone(),
                slots: Arc::clone(&self.slots),
            };

            thread::Builder::new()
                .name(format!("{}-worker-{index}", self.thread_name_prefix))
                .spawn(move || worker.run())
                .expect("failed to spawn worker thread: thread spawning failure is not supported");
        }

        // Only the workers hold output senders from here on.
        drop(output);

        let dispatch = DispatchLoop {
            admission: admission_rx,
            shutdown: shutdown_rx,
            queue,
        };

        let dispatcher = thread::Builder::new()
            .name(format!("{}-dispatch", self.thread_name_prefix))
            .spawn(move || dispatch.run())
            .expect("failed to spawn dispatch thread: thread spawning failure is not supported");

        lifecycle.active = Some(Active {
            admission,
            shutdown,
            dispatcher,
        });
        lifecycle.started = true;

        debug!(
            max_concurrency = self.slots.capacity().get(),
            "executor started"
        );

        true
    }

    /// Submits a future for execution. Returns whether it was accepted.
    ///
    /// Blocks until the dispatch loop takes the future. Returns `false` if the executor has
    /// not been started or has been stopped, including when it is stopped while this call is
    /// waiting for the hand-off.
    #[must_use]
    pub fn execute(&self, future: TimedFuture<T, E>) -> bool {
        let admission = {
            let lifecycle = self.lifecycle.lock();

            if lifecycle.stopped {
                return false;
            }

            match &lifecycle.active {
                Some(active) => active.admission.clone(),
                None => return false,
            }
        };

        // The lock is released before blocking so that `stop()` can proceed.
        admission.send(future).is_ok()
    }
}

impl<T, E> Executor<T, E> {
    /// Stops the executor. Further [`execute()`](Self::execute) calls return `false`.
    ///
    /// Futures already accepted keep running and are still published to the output stream.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyStopped`] if the executor was already stopped.
    pub fn stop(&self) -> Result<(), AlreadyStopped> {
        let active = {
            let mut lifecycle = self.lifecycle.lock();

            if lifecycle.stopped {
                return Err(AlreadyStopped::new());
            }

            lifecycle.stopped = true;

            // Never started: nobody else holds an output sender, so this closes the stream.
            lifecycle.output = None;

            lifecycle.active.take()
        };

        if let Some(Active {
            admission,
            shutdown,
            dispatcher,
        }) = active
        {
            drop(admission);
            drop(shutdown);

            if let Err(payload) = dispatcher.join() {
                // The dispatch loop contains no user code, so a panic there is our own defect.
                panic::resume_unwind(payload);
            }
        }

        debug!("executor stopped");

        Ok(())
    }

    /// Returns the stream on which resolved futures are published.
    ///
    /// Each accepted future is published exactly once, whether it completed, timed out or was
    /// killed. The stream is shared: if several receivers read from it, each future goes to
    /// only one of them. It disconnects after the executor is stopped and every accepted future
    /// has been published.
    #[must_use]
    pub fn listen(&self) -> Receiver<TimedFuture<T, E>> {
        self.listener.clone()
    }

    /// Collects `total` resolved futures from the output stream, waiting at most `duration`.
    ///
    /// # Errors
    ///
    /// Returns [`GetError::TimedOut`] if the deadline passes first, or [`GetError::Closed`] if
    /// the output stream disconnects first. Either way the futures collected so far are
    /// returned inside the error.
    pub fn get(
        &self,
        total: usize,
        duration: Duration,
    ) -> Result<Vec<TimedFuture<T, E>>, GetError<T, E>> {
        // A duration that overflows `Instant` means we wait without a deadline.
        let deadline = Instant::now().checked_add(duration);

        // `total` is only an upper bound on what will arrive, so it does not size the buffer.
        let mut collected = Vec::new();

        while collected.len() < total {
            let received = match deadline {
                Some(deadline) => self.listener.recv_deadline(deadline),
                None => self
                    .listener
                    .recv()
                    .map_err(|RecvError| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(future) => collected.push(future),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(GetError::TimedOut {
                        requested: total,
                        collected,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(GetError::Closed {
                        requested: total,
                        collected,
                    });
                }
            }
        }

        Ok(collected)
    }

    /// Whether [`start()`](Self::start) has ever succeeded on this executor.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.lifecycle.lock().started
    }

    /// Whether [`stop()`](Self::stop) has been called on this executor.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.lifecycle.lock().stopped
    }

    /// The maximum number of futures that run at the same time.
    #[must_use]
    pub fn max_concurrency(&self) -> NonZero<usize> {
        self.slots.capacity()
    }

    /// How many futures currently hold a concurrency slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.slots.in_use()
    }
}

impl<T, E> fmt::Debug for Executor<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (started, stopped) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.started, lifecycle.stopped)
        };

        f.debug_struct(type_name::<Self>())
            .field("max_concurrency", &self.slots.capacity())
            .field("in_flight", &self.slots.in_use())
            .field("started", &started)
            .field("stopped", &stopped)
            .finish_non_exhaustive()
    }
}

impl<T, E> Drop for Executor<T, E> {
    fn drop(&mut self) {
        if self.stop().is_ok() {
            trace!("executor stopped on drop");
        }
    }
}

/// An admitted future waiting in the queue for a worker.
struct Admitted<T, E> {
    future: TimedFuture<T, E>,
    admitted_at: Instant,
}

/// The single long-lived control loop of a started executor.
struct DispatchLoop<T, E> {
    admission: Receiver<TimedFuture<T, E>>,
    shutdown: Receiver<()>,
    queue: Sender<Admitted<T, E>>,
}

impl<T, E> DispatchLoop<T, E> {
    fn run(self) {
        loop {
            crossbeam::select! {
                recv(self.shutdown) -> _ => break,
                recv(self.admission) -> message => {
                    let Ok(future) = message else {
                        break;
                    };

                    self.dispatch(future);
                }
            }
        }

        // Dropping `self` drops the admission receiver (failing any blocked submitters) and
        // the queue sender, after which the workers drain what is queued and exit.
        debug!("dispatch loop exiting");
    }

    fn dispatch(&self, future: TimedFuture<T, E>) {
        trace!(timeout = ?future.timeout(), "future dispatched");

        let admitted = Admitted {
            future,
            admitted_at: Instant::now(),
        };

        if let Err(SendError(admitted)) = self.queue.send(admitted) {
            // Every worker is gone, which only happens if they all panicked.
            warn!(
                state = ?admitted.future.state(),
                "no executor workers remain; admitted future discarded"
            );
        }
    }
}

/// One of the `max_concurrency` long-lived threads that run admitted futures.
struct Worker<T, E> {
    queue: Receiver<Admitted<T, E>>,
    output: Sender<TimedFuture<T, E>>,
    slots: Arc<Slots>,
}

impl<T, E> Worker<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn run(self) {
        // Ends once the dispatch loop has exited and the queue is empty.
        for Admitted {
            future,
            admitted_at,
        } in self.queue.iter()
        {
            let slot = self.slots.acquire();
            SLOT_WAIT_MS.with(|e| e.observe_millis(admitted_at.elapsed()));

            let succeeded = future.await_result().is_ok();

            drop(slot);

            trace!(succeeded, state = ?future.state(), "future finished");

            if self.output.send(future).is_err() {
                trace!("executor was dropped; resolved future discarded");
            }
        }

        trace!("executor worker exiting");
    }
}

/// Builder for configuring an [`Executor`].
#[derive(Debug)]
pub struct ExecutorBuilder {
    max_concurrency: NonZero<usize>,
    start: bool,
    thread_name_prefix: Cow<'static, str>,
}

impl ExecutorBuilder {
    fn new() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            start: true,
            thread_name_prefix: Cow::Borrowed(DEFAULT_THREAD_NAME_PREFIX),
        }
    }

    /// Sets how many futures may run at the same time.
    ///
    /// Default is 4.
    #[must_use]
    pub fn max_concurrency(mut self, max_concurrency: NonZero<usize>) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets whether [`build()`](Self::build) also starts the executor.
    ///
    /// Default is `true`.
    #[must_use]
    pub fn start(mut self, start: bool) -> Self {
        self.start = start;
        self
    }

    /// Sets the prefix used to name the dispatch and worker threads.
    ///
    /// Default is `"eventually"`.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<Cow<'static, str>>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Builds the executor with the configured settings.
    #[must_use]
    pub fn build<T, E>(self) -> Executor<T, E>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let (output, listener) = channel::unbounded();

        let executor = Executor {
            slots: Arc::new(Slots::new(self.max_concurrency)),
            thread_name_prefix: self.thread_name_prefix,
            lifecycle: Mutex::new(Lifecycle {
                started: false,
                stopped: false,
                output: Some(output),
                active: None,
            }),
            listener,
        };

        if self.start {
            executor.start();
        }

        executor
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::FutureError;

    assert_impl_all!(Executor<u32, String>: Send, Sync);

    fn quick_future(value: u32) -> TimedFuture<u32, String> {
        TimedFuture::new(
            move || {
                thread::sleep(Duration::from_millis(10));
                Ok(value)
            },
            Duration::from_secs(1),
        )
    }

    #[test]
    fn builder_defaults() {
        let executor = Executor::<u32, String>::builder()
            .start(false)
            .build::<u32, String>();

        assert_eq!(executor.max_concurrency(), DEFAULT_MAX_CONCURRENCY);
        assert!(!executor.is_started());
        assert!(!executor.is_stopped());
        assert_eq!(executor.in_flight(), 0);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn start_succeeds_once() {
        with_watchdog(|| {
            let executor = Executor::<u32, String>::new(nz!(1), false);
            assert!(!executor.is_started());

            assert!(executor.start());
            assert!(executor.is_started());

            assert!(!executor.start());
            assert!(executor.is_started());
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn stop_succeeds_once() {
        with_watchdog(|| {
            let executor = Executor::<u32, String>::new(nz!(1), true);

            assert_eq!(executor.stop(), Ok(()));
            assert!(matches!(executor.stop(), Err(AlreadyStopped { .. })));
            assert!(executor.is_stopped());

            assert!(!executor.execute(quick_future(1)));
        });
    }

    #[test]
    fn stopped_executor_never_starts() {
        with_watchdog(|| {
            let executor = Executor::<u32, String>::new(nz!(1), false);

            assert_eq!(executor.stop(), Ok(()));
            assert!(!executor.start());
            assert!(!executor.is_started());
        });
    }

    #[test]
    fn execute_before_start_is_rejected() {
        let executor = Executor::<u32, String>::new(nz!(1), false);

        assert!(!executor.execute(quick_future(1)));
    }

    #[test]
    fn stop_without_start_closes_stream() {
        with_watchdog(|| {
            let executor = Executor::<u32, String>::new(nz!(1), false);
            executor.stop().unwrap();

            let error = executor.get(1, Duration::from_secs(5)).unwrap_err();
            assert!(matches!(error, GetError::Closed { requested: 1, .. }));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn executes_and_publishes() {
        with_watchdog(|| {
            let executor = Executor::<u32, String>::new(nz!(2), true);

            assert!(executor.execute(quick_future(7)));

            let finished = executor.listen().recv().unwrap();
            assert_eq!(finished.get(), Ok(&7));
            assert!(finished.is_completed());
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn publishes_timed_out_and_killed_futures() {
        with_watchdog(|| {
            let executor = Executor::<u32, String>::new(nz!(2), true);

            let slow = TimedFuture::new(
                || {
                    thread::sleep(Duration::from_millis(200));
                    Ok(1)
                },
                Duration::from_millis(5),
            );
            let killed = quick_future(2);
            assert!(killed.kill());

            assert!(executor.execute(slow));
            assert!(executor.execute(killed));

            let finished = executor.get(2, Duration::from_secs(5)).unwrap();
            let mut errors: Vec<_> = finished
                .iter()
                .map(|f| f.get().unwrap_err().clone())
                .collect();
            errors.sort_by_key(|e| matches!(e, FutureError::TimedOut));

            assert_eq!(errors, vec![FutureError::Killed, FutureError::TimedOut]);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn get_times_out_with_partial_results() {
        with_watchdog(|| {
            let executor = Executor::<u32, String>::new(nz!(4), true);

            assert!(executor.execute(quick_future(1)));

            let error = executor.get(3, Duration::from_millis(300)).unwrap_err();

            assert!(error.is_timeout());
            assert_eq!(error.requested(), 3);
            assert_eq!(error.collected().len(), 1);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn get_with_huge_total_times_out_with_partial_results() {
        with_watchdog(|| {
            let executor = Executor::<u32, String>::new(nz!(1), true);

            assert!(executor.execute(quick_future(1)));
            thread::sleep(Duration::from_millis(100));

            let error = executor
                .get(usize::MAX, Duration::from_micros(1))
                .unwrap_err();

            assert!(error.is_timeout());
            assert_eq!(error.requested(), usize::MAX);
            assert!(error.collected().len() <= 1);
        });
    }

    #[test]
    fn get_zero_returns_immediately() {
        let executor = Executor::<u32, String>::new(nz!(1), false);

        assert!(executor.get(0, Duration::from_secs(60)).unwrap().is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn stream_closes_after_in_flight_work_drains() {
        with_watchdog(|| {
            let executor = Executor::<u32, String>::new(nz!(1), true);

            assert!(executor.execute(quick_future(1)));
            executor.stop().unwrap();

            let listener = executor.listen();
            let finished = listener.recv().unwrap();
            assert_eq!(finished.get(), Ok(&1));

            assert!(listener.recv().is_err());
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn every_accepted_future_is_published_when_stop_races_submission() {
        with_watchdog(|| {
            let executor = Arc::new(Executor::<u32, String>::new(nz!(2), true));

            let submitter = thread::spawn({
                let executor = Arc::clone(&executor);
                move || {
                    (0..200_u32)
                        .take_while(|&i| {
                            let future = TimedFuture::new(move || Ok(i), Duration::from_secs(1));
                            executor.execute(future)
                        })
                        .count()
                }
            });

            thread::sleep(Duration::from_millis(5));
            executor.stop().unwrap();

            let accepted = submitter.join().unwrap();
            let published = executor.listen().iter().count();

            assert_eq!(accepted, published);
        });
    }

    #[test]
    fn debug_output_reports_lifecycle() {
        let executor = Executor::<u32, String>::new(nz!(3), false);

        let debug = format!("{executor:?}");

        assert!(debug.contains("max_concurrency"));
        assert!(debug.contains("started: false"));
    }
}
