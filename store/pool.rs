//! Worker pools for whole-store operations and the monitor that reports their progress.

use log::info;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const MONITOR_POLL: Duration = Duration::from_millis(200);

/// A pool with one thread per logical processor.
pub fn processor_pool() -> Result<ThreadPool, ThreadPoolBuildError> {
    sized_pool(num_cpus::get())
}

pub fn sized_pool(threads: usize) -> Result<ThreadPool, ThreadPoolBuildError> {
    ThreadPoolBuilder::new().num_threads(threads.max(1)).build()
}

/// Runs `work`, which bumps the counter it is handed once per finished item, while a
/// monitor thread logs `done/total {label}` whenever the count moves. There is no
/// deadline: the caller waits for `work` however long it takes.
pub fn log_and_wait<T, F>(label: &str, total: usize, work: F) -> T
where
    F: FnOnce(&AtomicUsize) -> T,
{
    let completed = AtomicUsize::new(0);
    let finished = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            let mut reported = 0;
            loop {
                let done = completed.load(Ordering::Relaxed);
                if done != reported {
                    info!("{done}/{total} {label}");
                    reported = done;
                }
                if finished.load(Ordering::Relaxed) {
                    break;
                }
                thread::sleep(MONITOR_POLL);
            }
        });
        let result = work(&completed);
        finished.store(true, Ordering::Relaxed);
        result
    })
}
