//! A time-bounded, cancellable unit of work.

use std::any::{Any, type_name};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::task::Waker;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::FutureError;
use crate::metrics::{FUTURES_COMPLETED, FUTURES_KILLED, FUTURES_TIMED_OUT, OPERATION_TIME_MS};

mod get_async;

pub use get_async::*;

/// Caller-supplied work wrapped by a [`TimedFuture`].
///
/// The operation has no cancellation hook. Killing or timing out a future only decides its
/// reported outcome; an operation that is already running keeps running until it returns.
pub type Operation<T, E> = Box<dyn FnOnce() -> Result<T, E> + Send + 'static>;

/// What a resolved future reports: the operation's value or why there is none.
pub type Outcome<T, E> = Result<T, FutureError<E>>;

/// Lifecycle of a [`TimedFuture`].
///
/// `Pending` becomes `Running` on [`TimedFuture::run()`]. Exactly one of the three terminal
/// states follows, and the future never leaves it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum FutureState {
    /// Created but not yet started.
    Pending,

    /// Started; the operation and the timer are racing.
    Running,

    /// The operation returned (successfully or not) before the timer fired or a kill arrived.
    Completed,

    /// The timeout elapsed first.
    TimedOut,

    /// [`TimedFuture::kill()`] was called first.
    Killed,
}

impl FutureState {
    /// Whether this is one of the terminal states.
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Killed)
    }
}

/// Everything guarded by the arbitration lock.
struct Arbiter<T, E> {
    state: FutureState,

    // Taken by `run()`, or discarded if the future is killed before it ever runs.
    operation: Option<Operation<T, E>>,

    // Async waiters from `get_async()`.
    wakers: Vec<Waker>,
}

struct FutureCore<T, E> {
    timeout: Duration,
    arbiter: Mutex<Arbiter<T, E>>,
    resolved: Condvar,

    // Written exactly once, under the arbiter lock, by whichever resolver wins.
    outcome: OnceLock<Outcome<T, E>>,
}

impl<T, E> FutureCore<T, E> {
    /// The single arbitration point. Commits `state` and `outcome` if the future is not yet done.
    ///
    /// Returns whether this call won. A losing call leaves the future untouched.
    #[cfg_attr(test, mutants::skip)] // Mutations here hang every waiter.
    fn resolve(&self, state: FutureState, outcome: Outcome<T, E>) -> bool {
        debug_assert!(state.is_done());

        let (wakers, discarded_operation) = {
            let mut arbiter = self.arbiter.lock();

            if arbiter.state.is_done() {
                return false;
            }

            if self.outcome.set(outcome).is_err() {
                unreachable!(
                    "outcome of an unresolved future was already recorded - arbitration is corrupted"
                );
            }

            arbiter.state = state;

            (mem::take(&mut arbiter.wakers), arbiter.operation.take())
        };

        // Killed before it ever ran; the closure may own resources so release them now.
        drop(discarded_operation);

        match state {
            FutureState::Completed => FUTURES_COMPLETED.with(|e| e.observe_once()),
            FutureState::TimedOut => FUTURES_TIMED_OUT.with(|e| e.observe_once()),
            FutureState::Killed => FUTURES_KILLED.with(|e| e.observe_once()),
            FutureState::Pending | FutureState::Running => {}
        }

        trace!(?state, "future resolved");

        self.resolved.notify_all();

        for waker in wakers {
            waker.wake();
        }

        true
    }

    fn state(&self) -> FutureState {
        self.arbiter.lock().state
    }

    fn wait_until_done(&self) {
        let mut arbiter = self.arbiter.lock();

        while !arbiter.state.is_done() {
            self.resolved.wait(&mut arbiter);
        }
    }

    fn outcome(&self) -> &Outcome<T, E> {
        self.outcome
            .get()
            .expect("a done future always has a recorded outcome")
    }
}

/// A handle to one execution of an [`Operation`] with a deadline and cooperative cancellation.
///
/// After [`run()`](Self::run) the operation races against a timer and against
/// [`kill()`](Self::kill). Whichever finishes first decides the outcome, which then never
/// changes. [`get()`](Self::get) blocks until that happens and can be called any number of
/// times, always returning the same values.
///
/// The handle is cheap to clone. All clones refer to the same future.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use eventually::{FutureError, TimedFuture};
///
/// let quick = TimedFuture::<_, String>::new(|| Ok(42), Duration::from_secs(1));
/// assert_eq!(quick.await_result(), Ok(&42));
///
/// let slow = TimedFuture::<u32, String>::new(
///     || {
///         std::thread::sleep(Duration::from_millis(200));
///         Ok(1)
///     },
///     Duration::from_millis(10),
/// );
/// assert_eq!(slow.await_result(), Err(&FutureError::TimedOut));
/// assert!(slow.is_timed_out());
/// ```
pub struct TimedFuture<T, E> {
    core: Arc<FutureCore<T, E>>,
}

impl<T, E> TimedFuture<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a future for `operation` that times out `timeout` after it is started.
    ///
    /// Nothing runs until [`run()`](Self::run) or [`await_result()`](Self::await_result).
    #[must_use]
    pub fn new<F>(operation: F, timeout: Duration) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        Self {
            core: Arc::new(FutureCore {
                timeout,
                arbiter: Mutex::new(Arbiter {
                    state: FutureState::Pending,
                    operation: Some(Box::new(operation)),
                    wakers: Vec::new(),
                }),
                resolved: Condvar::new(),
                outcome: OnceLock::new(),
            }),
        }
    }

    /// Starts the race between the operation and the timeout, returning immediately.
    ///
    /// The operation runs on its own thread and the timeout is watched on another. Calling
    /// this on a future that is already running or done has no effect.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn a thread.
    pub fn run(&self) {
        let operation = {
            let mut arbiter = self.core.arbiter.lock();

            if arbiter.state != FutureState::Pending {
                return;
            }

            arbiter.state = FutureState::Running;
            arbiter.operation.take()
        };

        let Some(operation) = operation else {
            unreachable!("a pending future always still owns its operation");
        };

        let runner_core = Arc::clone(&self.core);
        thread::Builder::new()
            .name("eventually-operation".to_string())
            .spawn(move || run_operation(&runner_core, operation))
            .expect("failed to spawn operation thread: thread spawning failure is not supported");

        // A timeout so large that it overflows `Instant` can never fire, so we skip the watcher.
        if let Some(deadline) = Instant::now().checked_add(self.core.timeout) {
            let watcher_core = Arc::clone(&self.core);
            thread::Builder::new()
                .name("eventually-timer".to_string())
                .spawn(move || watch_deadline(&watcher_core, deadline))
                .expect("failed to spawn timer thread: thread spawning failure is not supported");
        }
    }

    /// Runs the future and blocks until it resolves.
    ///
    /// Equivalent to [`run()`](Self::run) followed by [`get()`](Self::get).
    pub fn await_result(&self) -> Result<&T, &FutureError<E>> {
        self.run();
        self.get()
    }
}

impl<T, E> TimedFuture<T, E> {
    /// Blocks until the future resolves and returns its outcome.
    ///
    /// Returns immediately if the future is already done. Every call returns the same values.
    ///
    /// This does not start the future. Calling it on a future nobody will
    /// [`run()`](TimedFuture::run) or [`kill()`](TimedFuture::kill) blocks forever.
    pub fn get(&self) -> Result<&T, &FutureError<E>> {
        self.core.wait_until_done();
        self.core.outcome().as_ref()
    }

    /// Returns the outcome if the future is done, without blocking.
    #[must_use]
    pub fn try_get(&self) -> Option<Result<&T, &FutureError<E>>> {
        if self.core.state().is_done() {
            Some(self.core.outcome().as_ref())
        } else {
            None
        }
    }

    /// Returns a [`Future`][std::future::Future] that resolves with the same value as
    /// [`get()`](Self::get), for use in async code.
    ///
    /// Like `get()`, this does not start the future.
    #[must_use]
    pub fn get_async(&self) -> GetAsync<'_, T, E> {
        GetAsync::new(self)
    }

    /// Requests cancellation and reports whether the future ended up killed.
    ///
    /// If the future is not yet done, it resolves as [`FutureState::Killed`] with
    /// [`FutureError::Killed`] and this returns `true`. A still-running operation is not
    /// interrupted; its eventual result is discarded.
    ///
    /// If the future is already done, nothing changes and this returns whether it had been
    /// killed before.
    ///
    /// Killing a future that was never started resolves it too; its operation is dropped
    /// without ever being called.
    pub fn kill(&self) -> bool {
        if self
            .core
            .resolve(FutureState::Killed, Err(FutureError::Killed))
        {
            return true;
        }

        // We lost the race, so the state is terminal and can no longer change.
        self.core.state() == FutureState::Killed
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> FutureState {
        self.core.state()
    }

    /// Whether the future has resolved (completed, timed out or was killed).
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Whether the operation won the race.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state() == FutureState::Completed
    }

    /// Whether the timeout won the race.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.state() == FutureState::TimedOut
    }

    /// Whether [`kill()`](Self::kill) won the race.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.state() == FutureState::Killed
    }

    /// The timeout this future was created with.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.core.timeout
    }

    /// Whether two handles refer to the same future.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.core, &b.core)
    }

    fn register_waker(&self, waker: &Waker) -> Option<Result<&T, &FutureError<E>>> {
        let mut arbiter = self.core.arbiter.lock();

        if arbiter.state.is_done() {
            return Some(self.core.outcome().as_ref());
        }

        if !arbiter.wakers.iter().any(|w| w.will_wake(waker)) {
            arbiter.wakers.push(waker.clone());
        }

        None
    }
}

impl<T, E> Clone for TimedFuture<T, E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T, E> fmt::Debug for TimedFuture<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("timeout", &self.core.timeout)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn run_operation<T, E>(core: &FutureCore<T, E>, operation: Operation<T, E>) {
    let started = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(operation));
    OPERATION_TIME_MS.with(|e| e.observe_millis(started.elapsed()));

    let outcome = match result {
        Ok(value) => value.map_err(FutureError::Failed),
        Err(payload) => {
            let message = format_panic_payload(&payload);
            warn!(panic_message = %message, "operation panicked");
            Err(FutureError::Panicked { message })
        }
    };

    if !core.resolve(FutureState::Completed, outcome) {
        trace!("operation returned after the future was already resolved; result discarded");
    }
}

#[cfg_attr(test, mutants::skip)] // Mutations here only delay or suppress timeouts.
fn watch_deadline<T, E>(core: &FutureCore<T, E>, deadline: Instant) {
    {
        let mut arbiter = core.arbiter.lock();

        while !arbiter.state.is_done() {
            if core.resolved.wait_until(&mut arbiter, deadline).timed_out() {
                break;
            }
        }

        if arbiter.state.is_done() {
            return;
        }
    }

    // Someone else may win between releasing the lock and resolving; `resolve` sorts that out.
    core.resolve(FutureState::TimedOut, Err(FutureError::TimedOut));
}

fn format_panic_payload(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
