//! Ordered fan-out over a fixed number of scoped worker threads.
//!
//! Items are handed out through a crossbeam channel; results are slotted back
//! by input index so completion order never leaks into the output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;

/// Cooperative cancellation flag shared between the pipeline and its workers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Applies `f` to every item using up to `workers` threads.
///
/// Returns results in input order, or `None` when cancellation stopped the
/// run before every item was processed. Partial results are dropped.
pub(crate) fn run_ordered<T, R, F>(
    items: &[T],
    workers: usize,
    cancel: &CancellationToken,
    f: F,
) -> Option<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.is_empty() {
        return (!cancel.is_cancelled()).then(Vec::new);
    }
    let workers = workers.clamp(1, items.len());

    if workers == 1 {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if cancel.is_cancelled() {
                return None;
            }
            out.push(f(item));
        }
        return Some(out);
    }

    let (job_tx, job_rx) = unbounded::<usize>();
    for idx in 0..items.len() {
        // Receiver is alive for the whole function; send cannot fail here.
        let _ = job_tx.send(idx);
    }
    drop(job_tx);

    let (result_tx, result_rx) = unbounded::<(usize, R)>();
    let f = &f;
    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                while let Ok(idx) = job_rx.recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if result_tx.send((idx, f(&items[idx]))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut slots: Vec<Option<R>> = (0..items.len()).map(|_| None).collect();
    for (idx, result) in result_rx.iter() {
        slots[idx] = Some(result);
    }
    slots.into_iter().collect()
}
