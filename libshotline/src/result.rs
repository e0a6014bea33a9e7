use ndarray::ArrayD;
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use super::event::EventId;

/// Numeric value produced by a processor
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Empty,
    Scalar(f64),
    Vector(Vec<f64>),
    Tensor(ArrayD<f64>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// A value gates a condition when it is a non-zero scalar
    pub fn is_true(&self) -> bool {
        matches!(self, Value::Scalar(v) if *v != 0.0)
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Empty => 0,
            Value::Scalar(_) => 1,
            Value::Vector(v) => v.len(),
            Value::Tensor(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultStatus {
    Available,
    /// The node's condition was false for this event
    Skipped,
    /// The node could not be computed for this event
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultData {
    pub status: ResultStatus,
    pub value: Value,
}

/// The result of one processor for one event.
///
/// Readers take a shared lock with [`NodeResult::read`]; the owning node takes the
/// exclusive lock only while storing a computed value. Every store bumps the version.
#[derive(Debug)]
pub struct NodeResult {
    event_id: EventId,
    version: AtomicU64,
    data: RwLock<ResultData>,
}

impl NodeResult {
    pub(crate) fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            version: AtomicU64::new(0),
            data: RwLock::new(ResultData {
                status: ResultStatus::Unavailable(String::from("not computed")),
                value: Value::Empty,
            }),
        }
    }

    pub(crate) fn skipped(event_id: EventId) -> Self {
        let result = Self::new(event_id);
        result.store(ResultStatus::Skipped, Value::Empty);
        result
    }

    pub(crate) fn store(&self, status: ResultStatus, value: Value) {
        let mut data = self.data.write();
        data.status = status;
        data.value = value;
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ResultData> {
        self.data.read()
    }

    pub fn value(&self) -> Value {
        self.data.read().value.clone()
    }

    pub fn status(&self) -> ResultStatus {
        self.data.read().status.clone()
    }

    pub fn is_available(&self) -> bool {
        self.data.read().status == ResultStatus::Available
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self.data.read().status, ResultStatus::Unavailable(_))
    }

    /// Whether this result opens a condition gate
    pub fn is_condition_true(&self) -> bool {
        let data = self.data.read();
        data.status == ResultStatus::Available && data.value.is_true()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(Value::Scalar(1.0).is_true());
        assert!(Value::Scalar(-0.5).is_true());
        assert!(!Value::Scalar(0.0).is_true());
        assert!(!Value::Empty.is_true());
        assert!(!Value::Vector(vec![1.0]).is_true());
    }

    #[test]
    fn test_store_bumps_version() {
        let result = NodeResult::new(EventId(3));
        assert_eq!(result.version(), 0);
        assert!(result.is_unavailable());
        result.store(ResultStatus::Available, Value::Scalar(2.0));
        assert_eq!(result.version(), 1);
        assert!(result.is_condition_true());
        assert_eq!(result.read().value.as_scalar(), Some(2.0));

        let skipped = NodeResult::skipped(EventId(3));
        assert_eq!(skipped.status(), ResultStatus::Skipped);
        assert!(!skipped.is_condition_true());
        assert!(skipped.value().is_empty());
    }
}
