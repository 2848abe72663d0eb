//! Serialized off-bus work.
//!
//! Anything that may block on the network (telemetry scrape, vehicle API)
//! runs on a single background worker so the RS-485 loop never misses its
//! deadlines. The queue is deduplicated by command tag: the bus loop may
//! ask for the same work every second, but at most one instance is queued
//! or running at a time.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Refresh generation/consumption telemetry from every source.
    CheckGreenEnergy,
    /// Ask the vehicle API to start or stop charging.
    Charge { start: bool },
    /// Fresh credentials arrived from the web interface.
    CarApiCredentials { email: String, password: String },
    Shutdown,
}

impl Task {
    /// Dedupe key. Start and stop share a tag, as queuing a stop behind a
    /// pending start (or vice versa) would only thrash the vehicle.
    fn tag(&self) -> &'static str {
        match self {
            Task::CheckGreenEnergy => "checkGreenEnergy",
            Task::Charge { .. } => "charge",
            Task::CarApiCredentials { .. } => "carApiEmailPassword",
            Task::Shutdown => "shutdown",
        }
    }
}

/// Cloneable producer half.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    in_flight: Arc<Mutex<HashSet<&'static str>>>,
}

impl TaskQueue {
    /// Queue a task unless one with the same tag is already queued or
    /// running. Returns whether the task was accepted.
    pub fn enqueue(&self, task: Task) -> bool {
        let tag = task.tag();

        {
            let mut in_flight = self.in_flight.lock().expect("task dedupe set poisoned");

            if !in_flight.insert(tag) {
                return false;
            }
        }

        if self.tx.send(task).is_err() {
            log::warn!("background worker gone, dropping task '{}'", tag);

            return false;
        }

        true
    }
}

/// The worker thread plus its queue.
pub struct TaskRunner {
    queue: TaskQueue,
    handle: JoinHandle<()>,
}

impl TaskRunner {
    /// Spawn the worker. `execute` runs each task in order on the worker
    /// thread and may block.
    pub fn spawn<F>(mut execute: F) -> Self
    where
        F: FnMut(Task) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Task>();
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let worker_set = Arc::clone(&in_flight);
        let handle = std::thread::Builder::new()
            .name("background-tasks".to_owned())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    let tag = task.tag();

                    if matches!(task, Task::Shutdown) {
                        break;
                    }

                    execute(task);

                    worker_set
                        .lock()
                        .expect("task dedupe set poisoned")
                        .remove(tag);
                }
            })
            .expect("spawn background worker");

        Self {
            queue: TaskQueue { tx, in_flight },
            handle,
        }
    }

    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    /// Let queued work drain, then stop and join the worker.
    pub fn shutdown(self) {
        // Bypasses dedupe deliberately: shutdown must always be delivered.
        let _ = self.queue.tx.send(Task::Shutdown);

        if self.handle.join().is_err() {
            log::error!("background worker panicked during shutdown");
        }
    }
}
