//! Runs a batch of slow lookups through an executor and collects them as they finish.
//!
//! Some lookups are too slow for their timeout and one is killed by the caller; all of them
//! still come out of the executor, each with its own outcome.

use std::thread;
use std::time::Duration;

use eventually::{Executor, FutureError, TimedFuture};
use new_zealand::nz;

fn lookup(id: u64) -> TimedFuture<String, String> {
    TimedFuture::new(
        move || {
            thread::sleep(Duration::from_millis(id.saturating_mul(20)));

            if id == 3 {
                return Err(format!("record {id} is corrupt"));
            }

            Ok(format!("record {id}"))
        },
        Duration::from_millis(100),
    )
}

fn main() {
    println!("=== eventually README example ===");

    let executor = Executor::<String, String>::builder()
        .max_concurrency(nz!(2))
        .thread_name_prefix("lookup")
        .build::<String, String>();

    let futures: Vec<_> = (0..8).map(lookup).collect();

    for future in &futures {
        assert!(executor.execute(future.clone()));
    }

    // The caller loses interest in the last lookup.
    if let Some(last) = futures.last() {
        last.kill();
    }

    match executor.get(futures.len(), Duration::from_secs(5)) {
        Ok(finished) => {
            for future in finished {
                match future.get() {
                    Ok(record) => println!("found {record}"),
                    Err(FutureError::Failed(reason)) => println!("lookup failed: {reason}"),
                    Err(FutureError::TimedOut) => println!("lookup timed out"),
                    Err(FutureError::Killed) => println!("lookup was killed"),
                    Err(other) => println!("lookup went wrong: {other}"),
                }
            }
        }
        Err(error) => println!("{error}; {} lookups finished", error.collected().len()),
    }

    executor.stop().expect("executor is stopped only once");
    println!("{executor:?}");
}
