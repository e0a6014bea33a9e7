use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::error::{panic_message, WorkerError};
use super::fault::FaultSlot;
use super::graph::ComputationGraph;
use super::pausable::PausableControl;
use super::ring::EventSlotRing;
use super::status::{Origin, RateReporter};

/// The graph currently used by the pool. Swapped as a whole on reload.
pub type SharedGraph = Arc<RwLock<Arc<ComputationGraph>>>;

#[derive(Debug)]
struct Worker {
    id: usize,
    control: Arc<PausableControl>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn join(&mut self) -> Result<(), WorkerError> {
        self.control.request_stop();
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                return Err(WorkerError::Panicked {
                    id: self.id,
                    message: panic_message(payload.as_ref()),
                });
            }
            spdlog::info!("Worker {} complete", self.id);
        }
        Ok(())
    }
}

/// Everything a worker thread needs, cloned out of the pool at spawn time
struct WorkerContext {
    id: usize,
    ring: Arc<EventSlotRing>,
    graph: SharedGraph,
    control: Arc<PausableControl>,
    fault: Arc<FaultSlot<WorkerError>>,
    reporter: RateReporter,
    timeout_ms: Arc<AtomicU64>,
}

/// A set of threads taking Filled slots from the ring and evaluating the graph on them.
///
/// Every worker owns a [`PausableControl`]; the pool pauses all of them to swap the
/// graph or change the number of workers. The first fatal error or panic of any
/// worker is kept in the pool's fault slot and that worker exits.
#[derive(Debug)]
pub struct WorkerPool {
    ring: Arc<EventSlotRing>,
    graph: SharedGraph,
    reporter: RateReporter,
    timeout_ms: Arc<AtomicU64>,
    fault: Arc<FaultSlot<WorkerError>>,
    workers: Vec<Worker>,
    next_id: usize,
}

impl WorkerPool {
    pub fn new(
        ring: Arc<EventSlotRing>,
        graph: ComputationGraph,
        reporter: RateReporter,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            ring,
            graph: Arc::new(RwLock::new(Arc::new(graph))),
            reporter,
            timeout_ms: Arc::new(AtomicU64::new(acquire_timeout.as_millis() as u64)),
            fault: Arc::new(FaultSlot::new()),
            workers: Vec::new(),
            next_id: 0,
        }
    }

    /// Spawn `n_workers` threads. Does nothing if the pool is already running.
    pub fn start(&mut self, n_workers: usize) -> Result<(), WorkerError> {
        if !self.workers.is_empty() {
            return Ok(());
        }
        for _ in 0..n_workers {
            self.spawn_worker()?;
        }
        spdlog::info!("Started {} workers", n_workers);
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<(), WorkerError> {
        let id = self.next_id;
        self.next_id += 1;
        let control = Arc::new(PausableControl::new());
        let context = WorkerContext {
            id,
            ring: self.ring.clone(),
            graph: self.graph.clone(),
            control: control.clone(),
            fault: self.fault.clone(),
            reporter: self.reporter.clone(),
            timeout_ms: self.timeout_ms.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || run_worker(context))?;
        self.workers.push(Worker {
            id,
            control,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Stop every worker and join them. Returns the first panic encountered.
    pub fn end(&mut self) -> Result<(), WorkerError> {
        for worker in self.workers.iter() {
            worker.control.request_stop();
        }
        self.ring.notify_all();
        let mut first_error = None;
        for mut worker in self.workers.drain(..) {
            if let Err(e) = worker.join() {
                spdlog::error!("An error occured joining worker {}: {}", worker.id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of workers still running
    pub fn running(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    /// Number of workers owned by the pool, alive or not
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn graph(&self) -> Arc<ComputationGraph> {
        self.graph.read().clone()
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn has_fault(&self) -> bool {
        self.fault.is_set()
    }

    pub fn take_fault(&self) -> Option<WorkerError> {
        self.fault.take()
    }

    /// Block until every worker is parked at a safe point (or has exited)
    pub fn pause_all(&self) -> Result<(), WorkerError> {
        for worker in self.workers.iter() {
            worker.control.request_pause(true)?;
        }
        spdlog::debug!("Paused {} workers", self.workers.len());
        Ok(())
    }

    pub fn resume_all(&self) -> Result<(), WorkerError> {
        for worker in self.workers.iter() {
            worker.control.resume()?;
        }
        Ok(())
    }

    /// Swap in a new graph and worker count.
    ///
    /// Workers are paused between events while the graph is replaced, so an event is
    /// always evaluated entirely by one graph. Surplus workers are stopped, missing
    /// ones are spawned with the new graph.
    pub fn reload_configuration(
        &mut self,
        graph: ComputationGraph,
        n_workers: usize,
        acquire_timeout: Duration,
    ) -> Result<(), WorkerError> {
        self.pause_all()?;
        *self.graph.write() = Arc::new(graph);
        self.timeout_ms
            .store(acquire_timeout.as_millis() as u64, Ordering::Relaxed);

        let mut first_error = None;
        while self.workers.len() > n_workers {
            if let Some(mut worker) = self.workers.pop() {
                if let Err(e) = worker.join() {
                    first_error.get_or_insert(e);
                }
            }
        }
        self.resume_all()?;
        while self.workers.len() < n_workers {
            self.spawn_worker()?;
        }
        spdlog::info!(
            "Reloaded worker pool with {} workers and {} processors",
            self.workers.len(),
            self.graph.read().len()
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn run_worker(context: WorkerContext) {
    let WorkerContext {
        id,
        ring,
        graph,
        control,
        fault,
        reporter,
        timeout_ms,
    } = context;
    control.attach();
    spdlog::info!("Worker {} started", id);

    while control.safe_point() {
        let timeout = Duration::from_millis(timeout_ms.load(Ordering::Relaxed));
        let handle = match ring.acquire_processable(timeout) {
            Some(h) => h,
            None => continue,
        };
        let event_id = handle.id();

        let outcome = if handle.is_valid() {
            let current = graph.read().clone();
            Some(std::panic::catch_unwind(AssertUnwindSafe(|| {
                ring.with_event(&handle, |event| {
                    (event.byte_count(), current.evaluate_event(event))
                })
            })))
        } else {
            None
        };

        if let Err(e) = ring.release_processed(handle) {
            spdlog::error!("Worker {} could not release event {}: {}", id, event_id, e);
            fault.record(WorkerError::RingError { id, source: e });
            break;
        }

        match outcome {
            None => spdlog::trace!("Worker {} skipped invalid event {}", id, event_id),
            Some(Ok((bytes, Ok(())))) => reporter.report(Origin::Worker(id), 1, bytes),
            Some(Ok((_, Err(e)))) => {
                spdlog::error!("Worker {} stopped at event {}: {}", id, event_id, e);
                fault.record(WorkerError::GraphError { id, source: e });
                break;
            }
            Some(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                spdlog::error!("Worker {} panicked at event {}: {}", id, event_id, message);
                fault.record(WorkerError::Panicked { id, message });
                break;
            }
        }
    }
    control.mark_finished();
}
