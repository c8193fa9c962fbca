//! Fixed-size worker pool fed by one bounded job queue.
//!
//! Workers are plain OS threads so blocking handlers never starve the
//! async reactor. Each worker waits on the shared tokio queue through a
//! runtime handle and runs the job synchronously.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info};

use crate::config::schema::TransportKind;
use crate::connection::{RequestView, ResponseSink};
use crate::observability::metrics;

/// A request waiting for a worker.
pub struct Job {
    pub request: RequestView,
    pub sink: Box<dyn ResponseSink>,
    pub transport: TransportKind,
    pub accepted_at: Instant,
}

/// Why a job was not queued. Either way the transport answers 503.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("job queue is full")]
    QueueFull,

    #[error("engine is stopping")]
    Stopped,
}

/// Submission side of the pool, cloned into every transport task.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
    stopping: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Queue a request without waiting.
    pub fn submit(
        &self,
        request: RequestView,
        sink: Box<dyn ResponseSink>,
        transport: TransportKind,
    ) -> Result<(), DispatchError> {
        if self.stopping.load(Ordering::Acquire) {
            metrics::record_queue_rejection("stopping");
            return Err(DispatchError::Stopped);
        }
        let job = Job {
            request,
            sink,
            transport,
            accepted_at: Instant::now(),
        };
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                metrics::record_queue_rejection("full");
                DispatchError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => {
                metrics::record_queue_rejection("stopping");
                DispatchError::Stopped
            }
        })
    }
}

pub(crate) struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
    stopping: Arc<AtomicBool>,
    dispatcher: Dispatcher,
}

impl WorkerPool {
    /// Spawn `concurrency` workers sharing a queue of `capacity` jobs.
    pub(crate) fn start<F>(
        concurrency: usize,
        capacity: usize,
        runtime: Handle,
        run: F,
    ) -> io::Result<Self>
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Arc::new(Mutex::new(rx));
        let (stop_tx, stop_rx) = watch::channel(false);
        let stopping = Arc::new(AtomicBool::new(false));
        let run = Arc::new(run);

        let mut workers = Vec::with_capacity(concurrency);
        for index in 0..concurrency.max(1) {
            let worker = Worker {
                queue: Arc::clone(&queue),
                stop_rx: stop_rx.clone(),
                stopping: Arc::clone(&stopping),
                runtime: runtime.clone(),
            };
            let run = Arc::clone(&run);
            let spawned = std::thread::Builder::new()
                .name(format!("engine-worker-{}", index))
                .spawn(move || worker.run(|job| run(job)));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Let the workers already running wind down before failing.
                    stopping.store(true, Ordering::Release);
                    let _ = stop_tx.send(true);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }
        info!(workers = workers.len(), queue_capacity = capacity, "worker pool started");

        Ok(Self {
            workers,
            stop_tx,
            dispatcher: Dispatcher {
                tx,
                stopping: Arc::clone(&stopping),
            },
            stopping,
        })
    }

    pub(crate) fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Refuse new jobs and tell workers to exit after their current one.
    pub(crate) fn signal_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let _ = self.stop_tx.send(true);
    }

    /// Wait for every worker thread. Blocking; call from a blocking context.
    pub(crate) fn join(self) {
        self.signal_stop();
        for handle in self.workers {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked outside a handler");
            }
        }
        info!("worker pool stopped");
    }
}

struct Worker {
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    stop_rx: watch::Receiver<bool>,
    stopping: Arc<AtomicBool>,
    runtime: Handle,
}

impl Worker {
    fn run(self, run: impl Fn(Job)) {
        let Worker {
            queue,
            mut stop_rx,
            stopping,
            runtime,
        } = self;
        loop {
            if stopping.load(Ordering::Acquire) {
                break;
            }
            let job = runtime.block_on(async {
                let mut queue = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = stop_rx.wait_for(|stop| *stop) => None,
                    job = queue.recv() => job,
                }
            });
            let Some(job) = job else { break };
            if stopping.load(Ordering::Acquire) {
                // Dropping the sink makes the transport answer 503.
                debug!(request_id = %job.request.request_id(), "discarding job dequeued after stop");
                break;
            }
            // Last line of defence: a panic escaping `run` must not take
            // the worker down with it.
            let request_id = job.request.request_id().to_string();
            if panic::catch_unwind(AssertUnwindSafe(|| run(job))).is_err() {
                error!(request_id = %request_id, "job panicked outside the request pipeline");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::sink;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn request(path: &str) -> RequestView {
        RequestView::builder("GET", path).build()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_jobs_run_on_worker_threads() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let pool = WorkerPool::start(3, 16, Handle::current(), move |job: Job| {
            let name = std::thread::current().name().unwrap_or_default().to_string();
            recorder
                .lock()
                .unwrap()
                .push((job.request.path_string(), name));
        })
        .unwrap();

        let dispatcher = pool.dispatcher();
        for i in 0..10 {
            let (tx, _rx) = sink::channel(Duration::from_secs(5));
            dispatcher
                .submit(request(&format!("/{}", i)), Box::new(tx), TransportKind::Http)
                .unwrap();
        }

        for _ in 0..100 {
            if seen.lock().unwrap().len() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::task::spawn_blocking(move || pool.join()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        let paths: HashSet<_> = seen.iter().map(|(path, _)| path.clone()).collect();
        assert_eq!(paths.len(), 10);
        assert!(seen.iter().all(|(_, name)| name.starts_with("engine-worker-")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_and_stop_reject() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Arc::new(StdMutex::new(release_rx));
        let pool = WorkerPool::start(1, 1, Handle::current(), move |_job: Job| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
        let dispatcher = pool.dispatcher();

        let submit = |path: &str| {
            let (tx, rx) = sink::channel(Duration::from_secs(5));
            (dispatcher.submit(request(path), Box::new(tx), TransportKind::Http), rx)
        };

        // One job occupies the worker, one fills the queue.
        let (first, _rx1) = submit("/busy");
        first.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (second, mut queued_rx) = submit("/queued");
        second.unwrap();
        let (third, _rx3) = submit("/overflow");
        assert_eq!(third, Err(DispatchError::QueueFull));

        pool.signal_stop();
        let (fourth, _rx4) = submit("/late");
        assert_eq!(fourth, Err(DispatchError::Stopped));

        release_tx.send(()).unwrap();
        tokio::task::spawn_blocking(move || pool.join()).await.unwrap();
        drop(dispatcher);

        // The queued job was never run; its sink closed without output.
        assert!(queued_rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_survives_panicking_job() {
        let served = Arc::new(StdMutex::new(Vec::new()));
        let recorder = Arc::clone(&served);
        let pool = WorkerPool::start(1, 4, Handle::current(), move |job: Job| {
            let path = job.request.path_string();
            if path == "/explode" {
                panic!("job blew up");
            }
            recorder.lock().unwrap().push(path);
        })
        .unwrap();
        let dispatcher = pool.dispatcher();

        let (tx, mut exploded_rx) = sink::channel(Duration::from_secs(5));
        dispatcher
            .submit(request("/explode"), Box::new(tx), TransportKind::Http)
            .unwrap();
        // The unwound job dropped its sink without output.
        assert!(exploded_rx.recv().await.is_none());

        let (tx, _rx) = sink::channel(Duration::from_secs(5));
        dispatcher
            .submit(request("/after"), Box::new(tx), TransportKind::Http)
            .unwrap();
        for _ in 0..100 {
            if !served.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::task::spawn_blocking(move || pool.join()).await.unwrap();
        assert_eq!(*served.lock().unwrap(), vec!["/after".to_string()]);
    }
}
