use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::runtime::{Builder, Runtime};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Jobs queued behind the one currently running for the same tag.
struct Slot {
    pending: VecDeque<Job>,
}

/// Runs background jobs on a shared pool, serialized per tag.
///
/// Sidecar writes and deletions are dispatched here keyed by the user key,
/// so operations on one key land on disk in put order (an overwritten
/// value's old file is only deleted after the new one is written), while
/// unrelated keys proceed in parallel. Dropping the executor waits for
/// in-flight jobs.
pub struct TagExecutor {
    runtime: Runtime,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl TagExecutor {
    pub fn new() -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("emberkv-external")
            .build()?;
        Ok(TagExecutor {
            runtime,
            slots: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Schedules `job` under `tag`, after every job already queued there.
    pub fn execute<F>(&self, tag: &str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(slot) = slots.get_mut(tag) {
                slot.pending.push_back(job);
                return;
            }
            slots.insert(tag.to_string(), Slot { pending: VecDeque::new() });
        }

        let tag = tag.to_string();
        let slots = Arc::clone(&self.slots);
        self.runtime.spawn_blocking(move || {
            let mut current = Some(job);
            while let Some(job) = current.take() {
                job();
                let mut slots = match slots.lock() {
                    Ok(slots) => slots,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match slots.get_mut(&tag).and_then(|slot| slot.pending.pop_front()) {
                    Some(next) => current = Some(next),
                    None => {
                        slots.remove(&tag);
                    }
                }
            }
        });
    }

    /// Blocks until every scheduled job has finished.
    pub fn wait_idle(&self) {
        loop {
            let idle = match self.slots.lock() {
                Ok(slots) => slots.is_empty(),
                Err(poisoned) => poisoned.into_inner().is_empty(),
            };
            if idle {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_jobs_run() {
        let executor = TagExecutor::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            let counter = counter.clone();
            executor.execute(&format!("tag-{i}"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        executor.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_same_tag_runs_in_order() {
        let executor = TagExecutor::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        // The first job blocks long enough for the rest to pile up behind
        // the same tag; they must still run in submission order.
        for i in 0..5 {
            let seen = seen.clone();
            executor.execute("key", move || {
                if i == 0 {
                    std::thread::sleep(Duration::from_millis(50));
                }
                seen.lock().unwrap().push(i);
            });
        }

        executor.wait_idle();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_distinct_tags_independent() {
        let executor = TagExecutor::new().unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for tag in ["a", "b", "c"] {
            let done = done.clone();
            executor.execute(tag, move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        executor.wait_idle();
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }
}
