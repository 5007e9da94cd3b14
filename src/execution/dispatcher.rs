//! Work Dispatch
//!
//! Two channels feed the workers:
//! - the work queue, holding `Start` items for instances ready to run
//! - the resume queue, filled by the notifier with async completions
//!
//! Resume items are taken first. External submissions are bounded by the
//! configured capacity; follow-up work produced by the engine is not.
//! A blocked worker waits on the work queue in short slices and checks
//! the resume queue between them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::error::{EngineError, Result};

use super::correlation::Notification;

/// Longest a worker blocks on the work queue without checking for resumes.
const RESUME_CHECK_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    Start { instance_id: String },
    Resume(Notification),
    /// Runs the completion callback of a finished run
    Complete { run_id: String },
}

pub struct WorkQueue {
    work_tx: Mutex<Sender<WorkItem>>,
    work_rx: Mutex<Receiver<WorkItem>>,
    resume_rx: Mutex<Receiver<Notification>>,
    pending: AtomicUsize,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize, resume_rx: Receiver<Notification>) -> Self {
        let (work_tx, work_rx) = channel();
        Self {
            work_tx: Mutex::new(work_tx),
            work_rx: Mutex::new(work_rx),
            resume_rx: Mutex::new(resume_rx),
            pending: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Enqueues external work, failing when the queue is full.
    pub fn submit(&self, item: WorkItem) -> Result<()> {
        let pending = self.pending.load(Ordering::SeqCst);
        if pending >= self.capacity {
            return Err(EngineError::QueueFull(pending));
        }
        self.push(item);
        Ok(())
    }

    /// Enqueues follow-up work unconditionally.
    pub fn push(&self, item: WorkItem) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let sent = self
            .work_tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .send(item);
        if let Err(e) = sent {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!("Work queue closed, dropping item: {:?}", e.0);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        self.pending() < self.capacity
    }

    /// Next item without blocking.
    pub fn try_next(&self) -> Option<WorkItem> {
        if let Some(item) = self.try_resume() {
            return Some(item);
        }
        let item = self
            .work_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .try_recv()
            .ok();
        self.taken(item)
    }

    /// Next item, blocking up to `timeout`.
    pub fn next_timeout(&self, timeout: Duration) -> Option<WorkItem> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_resume() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let slice = (deadline - now).min(RESUME_CHECK_INTERVAL);

            // Only one worker blocks on the receiver; the rest poll resumes
            let received = match self.work_rx.try_lock() {
                Ok(rx) => rx.recv_timeout(slice),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().recv_timeout(slice),
                Err(TryLockError::WouldBlock) => {
                    thread::sleep(slice);
                    continue;
                }
            };
            match received {
                Ok(item) => return self.taken(Some(item)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn try_resume(&self) -> Option<WorkItem> {
        self.resume_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .try_recv()
            .ok()
            .map(WorkItem::Resume)
    }

    fn taken(&self, item: Option<WorkItem>) -> Option<WorkItem> {
        if item.is_some() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }
}

/// Something that processes dequeued work.
pub trait WorkHandler: Send + Sync + 'static {
    fn handle(&self, item: WorkItem);
}

/// Fixed set of threads draining a [`WorkQueue`].
pub struct WorkerPool {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        workers: usize,
        queue: Arc<WorkQueue>,
        handler: Arc<dyn WorkHandler>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers.max(1) {
            let running = Arc::clone(&running);
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);

            let handle = thread::Builder::new()
                .name(format!("staterunner-worker-{}", index))
                .spawn(move || {
                    debug!("Worker {} started", index);
                    while running.load(Ordering::Relaxed) {
                        if let Some(item) = queue.next_timeout(poll_interval) {
                            handler.handle(item);
                        }
                    }
                    debug!("Worker {} stopped", index);
                })?;
            handles.push(handle);
        }

        info!("Started {} worker threads", handles.len());
        Ok(Self { running, handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Signals the workers and waits for them to finish their current item.
    pub fn shutdown(self) {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.handles {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}
