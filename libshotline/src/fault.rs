use parking_lot::Mutex;

/// Holds the first fatal error raised by a thread until the controller collects it.
///
/// Faults cross thread boundaries through this slot rather than through unwinding.
#[derive(Debug)]
pub struct FaultSlot<E> {
    inner: Mutex<Option<E>>,
}

impl<E> Default for FaultSlot<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl<E: std::fmt::Display> FaultSlot<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `fault` unless an earlier one is already recorded. Returns true if kept.
    pub fn record(&self, fault: E) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            spdlog::debug!("Dropping secondary fault: {}", fault);
            return false;
        }
        *inner = Some(fault);
        true
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn take(&self) -> Option<E> {
        self.inner.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fault_wins() {
        let slot: FaultSlot<String> = FaultSlot::new();
        assert!(!slot.is_set());
        assert!(slot.record(String::from("first")));
        assert!(!slot.record(String::from("second")));
        assert!(slot.is_set());
        assert_eq!(slot.take().as_deref(), Some("first"));
        assert!(slot.take().is_none());
    }
}
