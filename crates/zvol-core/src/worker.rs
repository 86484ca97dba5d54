//! Deferred worker
//!
//! Submitters that must not block hand requests to a per-volume worker
//! thread. The worker runs them in FIFO order through the same dispatch path
//! as inline requests. When destroy moves the volume to DRAINING the worker
//! finishes whatever is queued, marks the volume RETIRED, wakes the
//! destroyer and exits.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::backend::VolumeMode;
use crate::error::{BlockError, BlockResult};
use crate::request::{PendingCompletion, Request};
use crate::volume::{Lifecycle, QueuedRequest, Zvol};

impl Zvol {
    /// Queue a request for the worker
    pub(crate) fn enqueue(&self, request: Request) -> BlockResult<PendingCompletion> {
        if self.mode() != VolumeMode::Geom {
            return Err(BlockError::Unsupported(format!(
                "deferred submission on a {} volume",
                self.mode()
            )));
        }

        let (done, pending) = PendingCompletion::new(request.id);
        let mut state = self.state.lock();
        if state.lifecycle() != Lifecycle::Active {
            return Err(BlockError::VolumeNotFound(state.name.clone()));
        }
        let was_empty = state.queue.is_empty();
        state.queue.push_back(QueuedRequest { request, done });
        drop(state);

        // Single consumer: it only sleeps on an empty queue.
        if was_empty {
            self.queue_ready.notify_one();
        }
        self.io_stats().record_deferred();
        Ok(pending)
    }
}

/// Start the worker thread for a volume
pub(crate) fn spawn(zvol: Arc<Zvol>, name: &str) -> BlockResult<JoinHandle<()>> {
    let thread_name = format!("{} {}", zvol.config.worker_name_prefix, name);
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || run(&zvol))
        .map_err(|e| BlockError::Resource(format!("failed to start worker for {name}: {e}")))
}

fn run(zvol: &Zvol) {
    debug!(volume = %zvol.name(), "deferred worker started");
    let mut processed = 0u64;

    loop {
        let next = {
            let mut state = zvol.state.lock();
            loop {
                if let Some(queued) = state.queue.pop_front() {
                    break Some(queued);
                }
                if state.lifecycle() == Lifecycle::Draining {
                    state.retire();
                    break None;
                }
                zvol.queue_ready.wait(&mut state);
            }
        };

        let Some(QueuedRequest { request, done }) = next else {
            zvol.retired.notify_all();
            break;
        };

        let read = zvol.suspend.read();
        let completion = zvol.execute(read, &request);
        let completion = zvol.finish(completion);
        // The submitter may have stopped waiting.
        let _ = done.send(completion);
        processed += 1;
    }

    info!(volume = %zvol.name(), processed, "deferred worker exiting");
}
