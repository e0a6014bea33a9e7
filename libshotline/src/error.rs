use std::path::PathBuf;
use thiserror::Error;

use super::event::EventId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PauseError {
    #[error("PausableControl was asked to resume but no pause request is outstanding")]
    NotPaused,
    #[error("PausableControl owner thread requested a blocking pause of itself")]
    SelfBlockingPause,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("EventSlotRing requires a capacity of at least 1")]
    InvalidCapacity,
    #[error("Handle for slot {index} is stale -- handle generation: {handle} slot generation: {slot}")]
    StaleHandle { index: usize, handle: u64, slot: u64 },
    #[error("Slot {index} is in state {found} but the release expected {expected}")]
    WrongState {
        index: usize,
        found: &'static str,
        expected: &'static str,
    },
}

/// Failure of a single processor's compute step.
///
/// Data errors are recovered as an unavailable result; fatal errors stop the worker.
#[derive(Debug, Clone, Error)]
pub enum ComputeError {
    #[error("{0}")]
    Data(String),
    #[error("{0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("ComputationGraph found duplicate processor name: {0}")]
    DuplicateName(String),
    #[error("ComputationGraph processor {node} depends on {dependency}, which does not exist")]
    MissingDependency { node: String, dependency: String },
    #[error("ComputationGraph found a dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("ComputationGraph has no processor named {0}")]
    UnknownProcessor(String),
    #[error("ComputationGraph processor {node} failed for event {event}: {message}")]
    Fatal {
        node: String,
        event: EventId,
        message: String,
    },
    #[error("ComputationGraph processor {node} was given an invalid configuration: {message}")]
    BadProcessorConfig { node: String, message: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Source {name} failed: {message}")]
    Fault { name: String, message: String },
    #[error("Source thread panicked: {0}")]
    Panicked(String),
    #[error("Source failed due to ring error: {0}")]
    RingError(#[from] RingError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker {id} failed due to ComputationGraph error: {source}")]
    GraphError { id: usize, source: GraphError },
    #[error("Worker {id} failed due to ring error: {source}")]
    RingError { id: usize, source: RingError },
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },
    #[error("{0} workers exited without reporting an error")]
    Vanished(usize),
    #[error("Worker pool failed to spawn a thread: {0}")]
    SpawnError(#[from] std::io::Error),
    #[error("Worker pool failed due to pause error: {0}")]
    PauseError(#[from] PauseError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline failed due to Source error: {0}")]
    SourceError(#[from] SourceError),
    #[error("Pipeline failed due to Worker error: {0}")]
    WorkerError(#[from] WorkerError),
    #[error("Pipeline failed due to ComputationGraph error: {0}")]
    GraphError(#[from] GraphError),
    #[error("Pipeline failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Pipeline failed due to ring error: {0}")]
    RingError(#[from] RingError),
    #[error("Pipeline failed due to pause error: {0}")]
    PauseError(#[from] PauseError),
    #[error("Pipeline was used before start() was called")]
    NotStarted,
}

/// Render a panic payload captured by `catch_unwind` or `JoinHandle::join`.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}
