// 1. Local crate imports
use wavestore_core::{Error, Result};

// 2. External crate imports
use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TryRecvError};

// 3. Standard library imports
use std::panic::AssertUnwindSafe;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of OS worker threads
///
/// Jobs are closures pulled from a shared channel; the fixed thread count is
/// the pipeline's backpressure. Dropping the pool closes the channel and
/// joins every worker after it finishes its current job.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` worker threads (at least one)
    pub fn new(size: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size.max(1));

        for i in 0..size.max(1) {
            let receiver: Receiver<Job> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("wal-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        // A panicking job must not take the worker with it;
                        // the submitter sees the dropped result channel.
                        let _ = std::panic::catch_unwind(AssertUnwindSafe(job));
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Submits a job, returning a handle to its eventual result
    pub fn submit<T, F>(&self, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let sender = self.sender.as_ref().expect("pool is live until dropped");
        sender
            .send(Box::new(move || {
                let _ = tx.send(job());
            }))
            .expect("worker channel stays open while the pool exists");

        TaskHandle {
            rx,
            submitted_at: Instant::now(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Completion handle for one submitted job
pub struct TaskHandle<T> {
    rx: Receiver<Result<T>>,
    submitted_at: Instant,
}

impl<T> TaskHandle<T> {
    /// Non-blocking poll; `None` while the job is still running
    ///
    /// A worker that died without delivering (a panic) surfaces as an error.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::StorageEngine(
                "worker terminated without delivering a result".to_string(),
            ))),
        }
    }

    /// Time since the job was submitted
    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    /// Blocks until the job finishes
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(Error::StorageEngine(
                "worker terminated without delivering a result".to_string(),
            ))
        })
    }

    /// Blocks up to `timeout` for the job to finish
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => Err(Error::Timeout(timeout)),
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => Err(Error::StorageEngine(
                "worker terminated without delivering a result".to_string(),
            )),
        }
    }
}
