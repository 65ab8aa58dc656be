use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::app::error::AppError;

pub struct GlobalSemaphore {
    limit: usize,
    used: Mutex<usize>,
    cv: Condvar,
}

impl GlobalSemaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            used: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> GlobalPermit {
        let mut used = self.used.lock().unwrap_or_else(|err| err.into_inner());
        while *used >= self.limit {
            used = self.cv.wait(used).unwrap_or_else(|err| err.into_inner());
        }
        *used += 1;
        GlobalPermit {
            semaphore: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut used = self.used.lock().unwrap_or_else(|err| err.into_inner());
        *used = used.saturating_sub(1);
        self.cv.notify_one();
    }
}

pub struct GlobalPermit {
    semaphore: Arc<GlobalSemaphore>,
}

impl Drop for GlobalPermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Runs per-device jobs on scoped threads, at most `limit` at a time.
pub struct TaskScheduler {
    global: Arc<GlobalSemaphore>,
}

impl TaskScheduler {
    pub fn new(global_limit: usize) -> Self {
        Self {
            global: Arc::new(GlobalSemaphore::new(global_limit)),
        }
    }

    pub fn acquire_global(&self) -> GlobalPermit {
        self.global.acquire()
    }

    /// Applies `job` to every item concurrently and returns the results in
    /// input order. A panicking job yields an `ERR_SYSTEM` for its slot only.
    pub fn fan_out<T, R, F>(&self, items: &[T], trace_id: &str, job: F) -> Vec<Result<R, AppError>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R, AppError> + Sync,
    {
        let job = &job;
        thread::scope(|scope| {
            let handles: Vec<_> = items
                .iter()
                .map(|item| {
                    scope.spawn(move || {
                        let _permit = self.acquire_global();
                        job(item)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(AppError::system("Worker thread panicked", trace_id))
                    })
                })
                .collect()
        })
    }
}
