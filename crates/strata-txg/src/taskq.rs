//! Bounded fan-out for sync phases.
//!
//! A phase dispatches one task per shard onto at most `threads` scoped
//! workers. Workers pull the next shard index from a shared counter, so a
//! slow shard does not hold up the others. The call returns only after every
//! task has finished: that return is the phase's join barrier.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use strata_error::{Result, StrataError};
use tracing::trace;

/// Run `task(i)` for every `i in 0..tasks` on up to `threads` workers.
///
/// All tasks run to completion even if one fails, unless a failure has
/// already been observed, in which case unstarted tasks are skipped. The
/// first error is returned.
pub fn fan_out<F>(threads: usize, tasks: usize, task: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Sync,
{
    if tasks == 0 {
        return Ok(());
    }
    let workers = threads.clamp(1, tasks);
    trace!(target: "strata::taskq", tasks, workers, "fan_out_begin");
    if workers == 1 {
        for idx in 0..tasks {
            task(idx)?;
        }
        return Ok(());
    }

    let next = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<StrataError>> = Mutex::new(None);

    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| {
                loop {
                    if failed.load(Ordering::Acquire) {
                        break;
                    }
                    let idx = next.fetch_add(1, Ordering::AcqRel);
                    if idx >= tasks {
                        break;
                    }
                    if let Err(err) = task(idx) {
                        failed.store(true, Ordering::Release);
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                }
            });
        }
    });

    match first_error.into_inner() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
