use std::sync::Arc;

use super::error::ComputeError;
use super::event::Event;
use super::result::{NodeResult, Value};

/// A named computation in the ComputationGraph.
///
/// The graph guarantees that `compute` runs at most once per event id, after the
/// condition (if any) evaluated true and every dependency was resolved. `inputs`
/// holds the dependency results in the order of [`Processor::dependencies`].
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn condition(&self) -> Option<String> {
        None
    }

    fn compute(&self, event: &Event, inputs: &Inputs<'_>) -> Result<Value, ComputeError>;
}

/// Resolved dependency results handed to a compute step
#[derive(Debug, Clone, Copy)]
pub struct Inputs<'a> {
    names: &'a [String],
    results: &'a [Arc<NodeResult>],
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(names: &'a [String], results: &'a [Arc<NodeResult>]) -> Self {
        Self { names, results }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(|s| s.as_str())
    }

    pub fn result(&self, index: usize) -> Option<&Arc<NodeResult>> {
        self.results.get(index)
    }

    pub fn value(&self, index: usize) -> Result<Value, ComputeError> {
        self.results
            .get(index)
            .map(|r| r.value())
            .ok_or_else(|| ComputeError::Fatal(format!("no input at position {index}")))
    }

    /// Read input `index` as a scalar. Anything else is a data error.
    pub fn scalar(&self, index: usize) -> Result<f64, ComputeError> {
        match self.value(index)? {
            Value::Scalar(v) => Ok(v),
            Value::Empty => Err(ComputeError::Data(format!(
                "input {} has no value for this event",
                self.name(index).unwrap_or("?")
            ))),
            _ => Err(ComputeError::Data(format!(
                "input {} is not a scalar",
                self.name(index).unwrap_or("?")
            ))),
        }
    }
}
