//! Bounded worker pool and deferred-close IO worker.
//!
//! The pool runs submitted jobs on `max(4, hardware_concurrency)` threads (or
//! one, in single-threaded mode). `enqueue` never blocks the submitter on
//! running work; `wait` blocks until everything enqueued so far has drained.
//!
//! Error propagation is last-writer-wins: `wait` (and pool drop) surface the
//! *last* error any job returned, so multiple failures are lossy. Callers
//! that need per-task detail must capture their own results inside the job.

use std::fs::File;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Threading mode of the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    SingleThreaded,
    #[default]
    AllHwThreads,
}

impl PoolMode {
    fn thread_count(self) -> usize {
        match self {
            Self::SingleThreaded => 1,
            Self::AllHwThreads => thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(4),
        }
    }
}

struct PoolShared {
    pending: Mutex<usize>,
    drained: Condvar,
    last_error: Mutex<Option<anyhow::Error>>,
}

impl PoolShared {
    fn job_finished(&self, result: anyhow::Result<()>) {
        if let Err(err) = result {
            *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending -= 1;
        self.drained.notify_all();
    }
}

/// A bounded pool of worker threads executing queued jobs.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sender: Option<crossbeam_channel::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(mode: PoolMode) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let shared = Arc::new(PoolShared {
            pending: Mutex::new(0),
            drained: Condvar::new(),
            last_error: Mutex::new(None),
        });

        let workers = (0..mode.thread_count())
            .map(|i| {
                let receiver = receiver.clone();
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("kiln-pool-{i}"))
                    .spawn(move || {
                        // `recv` drains queued jobs even after the sender is
                        // dropped, then reports disconnect.
                        while let Ok(job) = receiver.recv() {
                            let result =
                                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                                    Ok(result) => result,
                                    Err(_) => Err(anyhow::anyhow!("worker pool job panicked")),
                                };
                            shared.job_finished(result);
                        }
                    })
                    .expect("failed to spawn worker pool thread")
            })
            .collect();

        Self {
            shared,
            sender: Some(sender),
            workers,
        }
    }

    /// Enqueue a job. Never blocks on running work.
    pub fn enqueue(&self, job: impl FnOnce() -> anyhow::Result<()> + Send + 'static) {
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *pending += 1;
        }
        let sender = self.sender.as_ref().expect("pool already shut down");
        if sender.send(Box::new(job)).is_err() {
            // Channel disconnected mid-shutdown; account for the job we
            // just registered so `wait` cannot hang.
            self.shared.job_finished(Err(anyhow::anyhow!(
                "worker pool shut down before job could run"
            )));
        }
    }

    /// Wait for all enqueued jobs to finish.
    ///
    /// Returns the last error any job produced since the previous `wait`.
    pub fn wait(&self) -> anyhow::Result<()> {
        let mut pending = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while *pending > 0 {
            pending = self
                .shared
                .drained
                .wait(pending)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(pending);

        match self
            .shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain the queue and exit.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(err) = self
            .shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            tracing::error!(target = "kiln.pool", error = %err, "worker pool job failed");
        }
    }
}

/// Serializes deferred file closes off the hot path.
///
/// Closing an artifact file can be surprisingly slow on some filesystems
/// (flush-on-close semantics). Handing the open handle to a background
/// thread lets the caller move on; when the worker was never started it
/// degrades to an inline synchronous close.
#[derive(Clone)]
pub struct IoWorker {
    inner: Arc<IoWorkerInner>,
}

struct IoWorkerInner {
    sender: Mutex<Option<crossbeam_channel::Sender<File>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoWorker {
    /// An IO worker that closes files inline.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(IoWorkerInner {
                sender: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn start(num_threads: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<File>();
        let workers = (0..num_threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("kiln-io-{i}"))
                    .spawn(move || {
                        for file in receiver {
                            drop(file);
                        }
                    })
                    .expect("failed to spawn io worker thread")
            })
            .collect();

        Self {
            inner: Arc::new(IoWorkerInner {
                sender: Mutex::new(Some(sender)),
                workers: Mutex::new(workers),
            }),
        }
    }

    /// Close `file` on the background worker, or inline when not started.
    pub fn defer_close(&self, file: File) {
        let guard = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(sender) => {
                if let Err(send_err) = sender.send(file) {
                    drop(send_err.into_inner());
                }
            }
            None => drop(file),
        }
    }

    /// Drain the queue and join the worker threads.
    pub fn stop(&self) {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for IoWorkerInner {
    fn drop(&mut self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_enqueued_jobs() {
        let pool = WorkerPool::new(PoolMode::AllHwThreads);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn wait_surfaces_a_job_error() {
        let pool = WorkerPool::new(PoolMode::SingleThreaded);
        pool.enqueue(|| Ok(()));
        pool.enqueue(|| Err(anyhow::anyhow!("disk full")));
        let err = pool.wait().unwrap_err();
        assert!(err.to_string().contains("disk full"));
        // The error is consumed; a subsequent wait is clean.
        pool.wait().unwrap();
    }

    #[test]
    fn panicking_job_becomes_an_error() {
        let pool = WorkerPool::new(PoolMode::SingleThreaded);
        pool.enqueue(|| panic!("boom"));
        assert!(pool.wait().is_err());
    }

    #[test]
    fn wait_is_reusable_across_batches() {
        let pool = WorkerPool::new(PoolMode::AllHwThreads);
        let counter = Arc::new(AtomicUsize::new(0));
        for round in 0..3 {
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                pool.enqueue(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            }
            pool.wait().unwrap();
            assert_eq!(counter.load(Ordering::SeqCst), (round + 1) * 8);
        }
    }

    #[test]
    fn io_worker_closes_deferred_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("artifact");
        let worker = IoWorker::start(1);

        {
            use std::io::Write;
            let mut file = File::create(&path).unwrap();
            file.write_all(b"payload").unwrap();
            worker.defer_close(file);
        }
        worker.stop();

        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn disabled_io_worker_closes_inline() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("artifact");
        let worker = IoWorker::disabled();
        worker.defer_close(File::create(&path).unwrap());
        assert!(path.exists());
    }
}
