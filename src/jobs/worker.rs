// Pool worker threads -- pull boxed jobs off the shared queue until the
// sender side closes.
//
// A job that panics is recovered here so the thread never dies; the job
// wrapper in the pool has already reported the panic to its handle.

use std::any::Any;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Spawn one named worker thread.
pub(crate) fn spawn_worker(name: String, queue: Arc<Mutex<Receiver<Job>>>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker_loop(&name, &queue))
}

fn worker_loop(name: &str, queue: &Mutex<Receiver<Job>>) {
    loop {
        // Hold the lock only while taking the next job
        let next = {
            let guard = queue.lock().unwrap_or_else(|e| e.into_inner());
            guard.recv()
        };

        let job = match next {
            Ok(job) => job,
            Err(_) => {
                log::debug!("{}: queue closed, exiting", name);
                return;
            }
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
        if result.is_err() {
            log::error!("{}: job panicked (recovered)", name);
        }
    }
}

/// Best-effort text from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
