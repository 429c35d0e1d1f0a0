//! Fixed-size worker pool with joinable task groups.
//!
//! Background dumps and parallel per-segment searches run here. Shutdown
//! refuses new submissions, drains the queue and joins every worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// `bind_cpu` pins worker `i` to core `i % cores`.
    pub fn new(threads: usize, bind_cpu: bool) -> Arc<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = crossbeam::channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver: Receiver<Job> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("anns-worker-{i}"))
                .spawn(move || {
                    if bind_cpu {
                        bind_to_cpu(i);
                    }
                    while let Ok(job) = receiver.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            log::error!("worker {i}: task panicked");
                        }
                    }
                })
                .expect("spawning pool worker");
            workers.push(handle);
        }
        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue a job; `false` once the pool is shutting down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock().expect("pool sender lock poisoned");
        match &*guard {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Run `job` on a worker and block for its result.
    pub fn execute_and_wait<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let accepted = self.submit(move || {
            let _ = tx.send(job());
        });
        if !accepted {
            return Err(Error::Busy("thread pool is shut down".to_string()));
        }
        rx.recv()
            .map_err(|_| Error::Internal("pool task dropped its reply".to_string()))
    }

    pub fn make_group(self: &Arc<Self>) -> TaskGroup {
        TaskGroup {
            pool: Arc::clone(self),
            state: Arc::new(GroupState::default()),
        }
    }

    /// Refuse new submissions, drain, join workers. Idempotent.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().expect("pool sender lock poisoned").take();
        drop(sender);
        let handles: Vec<_> = self
            .workers
            .lock()
            .expect("pool workers lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("pool worker exited by panic");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Default)]
struct GroupState {
    pending: Mutex<usize>,
    finished: Condvar,
}

impl GroupState {
    fn enter(&self) {
        *self.pending.lock().expect("group lock poisoned") += 1;
    }

    fn exit(&self) {
        let mut pending = self.pending.lock().expect("group lock poisoned");
        *pending -= 1;
        if *pending == 0 {
            self.finished.notify_all();
        }
    }
}

/// A set of submitted tasks that can be awaited as one unit. Groups are
/// reusable: submit, wait, submit again.
pub struct TaskGroup {
    pool: Arc<ThreadPool>,
    state: Arc<GroupState>,
}

impl TaskGroup {
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        // Exit via a drop guard so a panicking job still releases the
        // group and wait_finish cannot hang.
        struct ExitGuard(Arc<GroupState>);
        impl Drop for ExitGuard {
            fn drop(&mut self) {
                self.0.exit();
            }
        }

        self.state.enter();
        let guard = ExitGuard(Arc::clone(&self.state));
        // On a refused submit the closure is dropped unrun and the guard
        // still releases the group.
        self.pool.submit(move || {
            let _guard = guard;
            job();
        })
    }

    /// Block until every task submitted through this group has run.
    pub fn wait_finish(&self) {
        let mut pending = self.state.pending.lock().expect("group lock poisoned");
        while *pending > 0 {
            pending = self
                .state
                .finished
                .wait(pending)
                .expect("group lock poisoned");
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_to_cpu(worker: usize) {
    unsafe {
        let cores = libc::sysconf(libc::_SC_NPROCESSORS_ONLN);
        if cores <= 0 {
            return;
        }
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(worker % cores as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::warn!("worker {worker}: CPU binding failed");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_cpu(_worker: usize) {}
