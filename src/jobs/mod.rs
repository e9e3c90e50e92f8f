// Background work: a fixed pool of named threads with completion handles.
//
// The episode manager hands a finished capture session to the pool and
// polls the returned handle on later ticks; workers never call back into
// the scheduling side.

mod worker;


use std::sync::mpsc::{self, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle as ThreadHandle;
use std::time::Duration;

use crate::error::{Result, SummaryError};
use worker::{panic_message, spawn_worker, Job};

pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    threads: Vec<ThreadHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, name: &str) -> Result<Self> {
        if size < 1 {
            return Err(SummaryError::Config("worker pool needs at least one thread".to_string()));
        }

        let (tx, rx) = mpsc::channel::<Job>();
        let queue = Arc::new(Mutex::new(rx));
        let mut threads = Vec::with_capacity(size);
        for i in 0..size {
            let handle = spawn_worker(format!("{}-{}", name, i), Arc::clone(&queue))
                .map_err(|e| SummaryError::Worker(format!("failed to spawn {} worker: {}", name, e)))?;
            threads.push(handle);
        }

        log::debug!("Worker pool {} started with {} threads", name, size);
        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(tx)),
            threads,
        })
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Queue a job. A panic inside `f` resolves the handle with
    /// `SummaryError::Worker`.
    pub fn submit<T, F>(&self, label: &str, f: F) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Result<T>>();
        let job_label = label.to_string();
        let job: Job = Box::new(move || {
            let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
                Ok(outcome) => outcome,
                Err(payload) => Err(SummaryError::Worker(format!(
                    "job {} panicked: {}",
                    job_label,
                    panic_message(payload.as_ref())
                ))),
            };
            // receiver may have been dropped; nobody is waiting then
            let _ = tx.send(outcome);
        });

        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let sender = guard
            .as_ref()
            .ok_or_else(|| SummaryError::Worker(format!("worker pool {} is shut down", self.name)))?;
        sender
            .send(job)
            .map_err(|_| SummaryError::Worker(format!("worker pool {} is shut down", self.name)))?;

        Ok(JobHandle {
            label: label.to_string(),
            rx,
            finished: false,
        })
    }

    /// Stop accepting jobs, let queued ones finish, join the threads.
    pub fn shutdown(&mut self) {
        {
            let mut guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            guard.take();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Worker pool {}: thread exited abnormally", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Completion side of a submitted job. Yields its result exactly once.
pub struct JobHandle<T> {
    label: String,
    rx: mpsc::Receiver<Result<T>>,
    finished: bool,
}

impl<T> JobHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Non-blocking. `None` while the job is still running.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        if self.finished {
            return None;
        }
        match self.rx.try_recv() {
            Ok(outcome) => self.finish(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.finish(Err(self.lost())),
        }
    }

    /// Block up to `timeout`. `None` if the job is still running after it.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T>> {
        if self.finished {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => self.finish(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => self.finish(Err(self.lost())),
        }
    }

    fn finish(&mut self, outcome: Result<T>) -> Option<Result<T>> {
        self.finished = true;
        Some(outcome)
    }

    fn lost(&self) -> SummaryError {
        SummaryError::Worker(format!("job {} ended without a result", self.label))
    }
}
