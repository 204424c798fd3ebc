//! Concurrency slots that bound how many futures an executor runs at once.

use std::num::NonZero;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A counting semaphore with a fixed number of slots.
///
/// Slots are handed out as [`SlotGuard`]s, so every acquire is paired with exactly one release.
#[derive(Debug)]
pub(crate) struct Slots {
    capacity: NonZero<usize>,
    in_use: Mutex<usize>,
    released: Condvar,
}

impl Slots {
    pub(crate) fn new(capacity: NonZero<usize>) -> Self {
        Self {
            capacity,
            in_use: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// Blocks until a slot is free and takes it.
    #[cfg_attr(test, mutants::skip)] // Mutations here deadlock rather than fail.
    pub(crate) fn acquire(self: &Arc<Self>) -> SlotGuard {
        let mut in_use = self.in_use.lock();

        while *in_use >= self.capacity.get() {
            self.released.wait(&mut in_use);
        }

        *in_use = in_use
            .checked_add(1)
            .expect("in-use count is bounded by capacity so cannot overflow");

        SlotGuard {
            slots: Arc::clone(self),
        }
    }

    pub(crate) fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    pub(crate) fn capacity(&self) -> NonZero<usize> {
        self.capacity
    }

    fn release(&self) {
        {
            let mut in_use = self.in_use.lock();

            *in_use = in_use
                .checked_sub(1)
                .expect("released a slot that was never acquired");
        }

        self.released.notify_one();
    }
}

/// One held slot. Dropping the guard returns the slot to the pool.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    slots: Arc<Slots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use new_zealand::nz;
    use testing::with_watchdog;

    use super::*;

    #[test]
    fn acquire_and_release_tracks_usage() {
        let slots = Arc::new(Slots::new(nz!(2)));

        let first = slots.acquire();
        assert_eq!(slots.in_use(), 1);

        let second = slots.acquire();
        assert_eq!(slots.in_use(), 2);

        drop(first);
        assert_eq!(slots.in_use(), 1);

        drop(second);
        assert_eq!(slots.in_use(), 0);
    }

    #[test]
    fn capacity_is_reported() {
        let slots = Slots::new(nz!(7));

        assert_eq!(slots.capacity().get(), 7);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn acquire_blocks_until_release() {
        with_watchdog(|| {
            let slots = Arc::new(Slots::new(nz!(1)));
            let acquired_second = Arc::new(AtomicUsize::new(0));

            let held = slots.acquire();

            let waiter = thread::spawn({
                let slots = Arc::clone(&slots);
                let acquired_second = Arc::clone(&acquired_second);

                move || {
                    let _guard = slots.acquire();
                    acquired_second.store(1, Ordering::SeqCst);
                }
            });

            thread::sleep(Duration::from_millis(50));
            assert_eq!(acquired_second.load(Ordering::SeqCst), 0);

            drop(held);
            waiter.join().unwrap();

            assert_eq!(acquired_second.load(Ordering::SeqCst), 1);
            assert_eq!(slots.in_use(), 0);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn never_exceeds_capacity_under_contention() {
        with_watchdog(|| {
            let slots = Arc::new(Slots::new(nz!(3)));
            let probe = testing::ConcurrencyProbe::new();

            let handles: Vec<_> = (0..12)
                .map(|_| {
                    let slots = Arc::clone(&slots);
                    let probe = probe.clone();

                    thread::spawn(move || {
                        let _slot = slots.acquire();
                        let _entered = probe.enter();
                        thread::sleep(Duration::from_millis(5));
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert!(probe.peak() <= 3);
            assert_eq!(probe.current(), 0);
        });
    }
}
