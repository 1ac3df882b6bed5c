//! Background chunk persistence.
//!
//! A [`WorldSaver`] owns one dedicated worker thread. Producers hand it
//! captured [`SaveTask`]s; the worker writes them in submission order. On
//! [`WorldSaver::signal_stop`] the worker stops waiting for new work, drains
//! everything still queued (reporting progress in tenths), then stops every
//! world's region timeout thread and closes its region files.
//!
//! Lifecycle: `NotStarted -> Running -> Stopping -> Draining -> Terminated`.
//!
//! Submissions are accepted until the worker is `Terminated`. The worker only
//! enters `Terminated` after seeing an empty queue while holding the state
//! lock that submitters also hold while enqueueing, so nothing submitted
//! before that point is lost. Later submissions are written directly on the
//! caller's thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use strata_common::{ChunkCoord, WorldId};
use tracing::{debug, error, info, warn};

use crate::chunk::Chunk;
use crate::config::PersistenceConfig;
use crate::error::{PersistenceError, PersistenceResult};
use crate::save_queue::{SaveQueue, Take};
use crate::save_task::SaveTask;
use crate::world::{World, WorldRegistry};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// No worker thread yet.
    NotStarted,
    /// Blocking on the queue and writing tasks.
    Running,
    /// Stop signalled; the current task finishes before draining.
    Stopping,
    /// Writing whatever is left in the queue.
    Draining,
    /// Queue empty and region files closed (or closing).
    Terminated,
}

/// Notifications published by the saver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveEvent {
    /// A chunk was written.
    Saved {
        /// World id
        world: WorldId,
        /// Chunk coordinate
        coord: ChunkCoord,
        /// Revision written
        revision: u64,
        /// Written on the submitting thread after termination
        direct: bool,
    },
    /// A chunk could not be written.
    Failed {
        /// World id
        world: WorldId,
        /// Chunk coordinate
        coord: ChunkCoord,
        /// Error description
        reason: String,
    },
    /// Drain progress, in percent of the queue length at drain start.
    DrainProgress {
        /// Multiple of ten; may exceed 100 if work arrives during the drain
        percent: usize,
    },
    /// The worker finished and closed all region files.
    Terminated,
}

/// Snapshot of the saver counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaverStats {
    /// Chunks written successfully
    pub saved: u64,
    /// Tasks that failed
    pub failed: u64,
    /// Tasks written on the caller's thread after termination
    pub direct: u64,
    /// Tasks executed during the drain phase
    pub drained: u64,
}

#[derive(Debug, Default)]
struct Counters {
    saved: AtomicU64,
    failed: AtomicU64,
    direct: AtomicU64,
    drained: AtomicU64,
}

/// Tracks drain progress in tenths of the queue length seen at drain start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainProgress {
    total: usize,
    saved: usize,
    last_tenth: usize,
}

impl DrainProgress {
    /// Starts tracking a drain of `total` queued tasks.
    #[must_use]
    pub const fn new(total: usize) -> Self {
        Self {
            total,
            saved: 0,
            last_tenth: 0,
        }
    }

    /// Records one finished task. Returns the new tenth when it increased.
    ///
    /// Tasks that arrive after the drain started still count, so the tenth
    /// can pass 10. A drain that started empty never reports.
    pub fn record(&mut self) -> Option<usize> {
        self.saved += 1;
        if self.total == 0 {
            return None;
        }
        let tenth = self.saved * 10 / self.total;
        if tenth > self.last_tenth {
            self.last_tenth = tenth;
            Some(tenth)
        } else {
            None
        }
    }

    /// Queue length when the drain began.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Tasks finished so far.
    #[must_use]
    pub const fn saved(&self) -> usize {
        self.saved
    }
}

struct Shared {
    queue: SaveQueue<SaveTask>,
    state: Mutex<WorkerState>,
    registry: Arc<WorldRegistry>,
    counters: Counters,
    subscribers: Mutex<Vec<Sender<SaveEvent>>>,
}

impl Shared {
    fn publish(&self, event: &SaveEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Runs one task, containing any error or panic it produces.
    fn run_task(&self, task: &SaveTask, direct: bool) {
        let world = task.world();
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.execute())).unwrap_or_else(
            |payload| {
                Err(PersistenceError::TaskPanicked {
                    world: world.name().to_string(),
                    coord: task.coord(),
                    message: panic_message(payload.as_ref()),
                })
            },
        );

        match result {
            Ok(outcome) => {
                self.counters.saved.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Saved chunk {} of world '{}' ({} bytes)",
                    outcome.coord,
                    world.name(),
                    outcome.bytes
                );
                self.publish(&SaveEvent::Saved {
                    world: world.id(),
                    coord: outcome.coord,
                    revision: outcome.revision,
                    direct,
                });
            },
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                match &e {
                    PersistenceError::DestinationUnavailable { .. } => {
                        error!(
                            "World saving thread unable to open file for chunk {} of world '{}'",
                            task.coord(),
                            world.name()
                        );
                    },
                    _ => error!("Failed to save chunk {}: {e}", task.coord()),
                }
                self.publish(&SaveEvent::Failed {
                    world: world.id(),
                    coord: task.coord(),
                    reason: e.to_string(),
                });
            },
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    fn run(&self) {
        info!("World saving thread started");
        loop {
            match self.queue.take() {
                Take::Task(task) => self.run_task(&task, false),
                Take::Interrupted => break,
            }
        }

        self.set_state(WorkerState::Draining);
        self.drain();
        self.close_regions();
        self.publish(&SaveEvent::Terminated);
        info!("World saving thread finished");
    }

    fn drain(&self) {
        let mut progress = DrainProgress::new(self.queue.len());
        if progress.total() > 0 {
            info!("Saving {} queued chunks", progress.total());
        }

        loop {
            while let Some(task) = self.queue.poll() {
                self.run_task(&task, false);
                self.counters.drained.fetch_add(1, Ordering::Relaxed);
                if let Some(tenth) = progress.record() {
                    info!("Saved {tenth}0% of queued chunks");
                    self.publish(&SaveEvent::DrainProgress {
                        percent: tenth * 10,
                    });
                }
            }

            let mut state = self.state.lock();
            if self.queue.is_empty() {
                *state = WorkerState::Terminated;
                return;
            }
        }
    }

    fn close_regions(&self) {
        let worlds = self.registry.worlds();
        for world in &worlds {
            world.region_file_manager().stop_timeout_thread();
        }
        for world in &worlds {
            world.region_file_manager().close_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The chunk persistence pipeline: one queue, one worker thread.
pub struct WorldSaver {
    shared: Arc<Shared>,
    thread_name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
    exited_tx: Mutex<Option<Sender<()>>>,
    exited_rx: Receiver<()>,
}

impl std::fmt::Debug for WorldSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldSaver")
            .field("state", &self.state())
            .field("queued", &self.queued())
            .field("thread_name", &self.thread_name)
            .finish_non_exhaustive()
    }
}

impl WorldSaver {
    /// Creates a saver for the worlds in `registry`. The worker is not started.
    #[must_use]
    pub fn new(registry: Arc<WorldRegistry>, config: &PersistenceConfig) -> Self {
        let (exited_tx, exited_rx) = bounded(0);
        Self {
            shared: Arc::new(Shared {
                queue: SaveQueue::new(),
                state: Mutex::new(WorkerState::NotStarted),
                registry,
                counters: Counters::default(),
                subscribers: Mutex::new(Vec::new()),
            }),
            thread_name: config.worker_thread_name.clone(),
            handle: Mutex::new(None),
            exited_tx: Mutex::new(Some(exited_tx)),
            exited_rx,
        }
    }

    /// Starts the worker thread if it has never been started.
    pub fn start(&self) -> PersistenceResult<()> {
        let mut state = self.shared.state.lock();
        if *state != WorkerState::NotStarted {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let exited = self.exited_tx.lock().clone();
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                // Dropped when the thread exits, however it exits.
                let _exited = exited;
                shared.run();
            })?;

        // The worker now holds the only sender.
        self.exited_tx.lock().take();
        *self.handle.lock() = Some(handle);
        *state = WorkerState::Running;
        Ok(())
    }

    /// Captures `chunk` now and queues it for writing.
    pub fn request_save(&self, world: &Arc<World>, chunk: &Arc<Chunk>) {
        self.submit(SaveTask::capture(world, chunk));
    }

    /// Queues every loaded chunk of `world` that has unsaved changes.
    pub fn save_dirty(&self, world: &Arc<World>) -> usize {
        let dirty = world.dirty_chunks();
        for chunk in &dirty {
            self.request_save(world, chunk);
        }
        dirty.len()
    }

    /// Queues a task, or writes it on this thread once the worker has terminated.
    pub fn submit(&self, task: SaveTask) {
        let state = self.shared.state.lock();
        if *state != WorkerState::Terminated {
            self.shared.queue.submit(task);
            return;
        }
        drop(state);

        warn!("Attempt to queue chunks for saving after world saving thread shutdown");
        self.shared.counters.direct.fetch_add(1, Ordering::Relaxed);
        self.shared.run_task(&task, true);
    }

    /// Tells the worker to stop waiting for work and drain the queue.
    pub fn signal_stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == WorkerState::Running {
                *state = WorkerState::Stopping;
            }
        }
        self.shared.queue.interrupt();
    }

    /// Blocks until the worker thread has exited.
    ///
    /// Returns immediately if the worker was never started or has already
    /// been joined.
    pub fn await_termination(&self) {
        let Some(handle) = self.handle.lock().take() else {
            debug!("No world saving thread to wait for");
            return;
        };
        if handle.join().is_err() {
            error!("World saving thread panicked");
        }
    }

    /// Waits up to `timeout` for the worker thread to exit.
    ///
    /// Returns `true` if it exited. On timeout the wait is abandoned and the
    /// worker keeps running.
    pub fn await_termination_timeout(&self, timeout: Duration) -> bool {
        if self.state() == WorkerState::NotStarted {
            return true;
        }
        match self.exited_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.lock().take() {
                    if handle.join().is_err() {
                        error!("World saving thread panicked");
                    }
                }
                true
            },
            Err(RecvTimeoutError::Timeout) => {
                info!("Stopped waiting for world saving thread after {timeout:?}");
                false
            },
        }
    }

    /// Current worker state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Tasks waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> SaverStats {
        let c = &self.shared.counters;
        SaverStats {
            saved: c.saved.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            direct: c.direct.load(Ordering::Relaxed),
            drained: c.drained.load(Ordering::Relaxed),
        }
    }

    /// Subscribes to save events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<SaveEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }
}
