use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::error::{panic_message, SourceError};
use super::event::{Event, EventId};
use super::fault::FaultSlot;
use super::pausable::PausableControl;
use super::ring::EventSlotRing;
use super::status::{Origin, RateReporter};

/// What a source tells the runner about the event it just filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillReport {
    pub id: EventId,
    pub valid: bool,
    pub bytes: u64,
}

/// Anything that produces events: file replay, shared memory, network streams.
///
/// `fill` receives a freshly reset event and populates it. Returning `Ok(None)` ends
/// the source gracefully; an error is a source fault which stops the pipeline.
pub trait Source: Send {
    fn name(&self) -> &str;

    fn fill(&mut self, event: &mut Event) -> Result<Option<FillReport>, SourceError>;
}

/// Owns the thread that moves events from a [`Source`] into the ring
pub struct SourceRunner {
    name: String,
    source: Option<Box<dyn Source>>,
    control: Arc<PausableControl>,
    fault: Arc<FaultSlot<SourceError>>,
    exhausted: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SourceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRunner")
            .field("name", &self.name)
            .field("started", &self.handle.is_some())
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}

impl SourceRunner {
    pub fn new(source: Box<dyn Source>) -> Self {
        Self {
            name: source.name().to_string(),
            source: Some(source),
            control: Arc::new(PausableControl::new()),
            fault: Arc::new(FaultSlot::new()),
            exhausted: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Spawn the source thread. Calling start twice is a no-op.
    pub fn start(
        &mut self,
        ring: Arc<EventSlotRing>,
        reporter: RateReporter,
        acquire_timeout: Duration,
    ) -> Result<(), SourceError> {
        let source = match self.source.take() {
            Some(s) => s,
            None => return Ok(()),
        };
        let control = self.control.clone();
        let fault = self.fault.clone();
        let exhausted = self.exhausted.clone();
        let handle = std::thread::Builder::new()
            .name(format!("source-{}", self.name))
            .spawn(move || {
                run_source(
                    source,
                    &ring,
                    &control,
                    &fault,
                    &exhausted,
                    &reporter,
                    acquire_timeout,
                )
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control(&self) -> &Arc<PausableControl> {
        &self.control
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// True once the source reported it has no more events
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub fn has_fault(&self) -> bool {
        self.fault.is_set()
    }

    pub fn take_fault(&self) -> Option<SourceError> {
        self.fault.take()
    }

    /// Ask the source thread to finish and join it
    pub fn stop(&mut self) -> Result<(), SourceError> {
        self.control.request_stop();
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                return Err(SourceError::Panicked(panic_message(payload.as_ref())));
            }
            spdlog::info!("Source {} stopped", self.name);
        }
        Ok(())
    }
}

fn run_source(
    mut source: Box<dyn Source>,
    ring: &EventSlotRing,
    control: &PausableControl,
    fault: &FaultSlot<SourceError>,
    exhausted: &AtomicBool,
    reporter: &RateReporter,
    acquire_timeout: Duration,
) {
    control.attach();
    spdlog::info!("Source {} started", source.name());
    while control.safe_point() {
        let handle = match ring.acquire_fillable(acquire_timeout) {
            Some(h) => h,
            None => continue,
        };

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            ring.with_event_mut(&handle, |event| {
                event.reset();
                let outcome = source.fill(event);
                if let Ok(Some(report)) = &outcome {
                    event.set_id(report.id);
                    event.set_byte_count(report.bytes);
                }
                outcome
            })
        }))
        .unwrap_or_else(|payload| Err(SourceError::Panicked(panic_message(payload.as_ref()))));

        match outcome {
            Ok(Some(report)) => {
                if let Err(e) = ring.release_filled(handle, report.valid) {
                    spdlog::error!("Source {} could not publish event: {}", source.name(), e);
                    fault.record(SourceError::RingError(e));
                    break;
                }
                reporter.report(Origin::Source, 1, report.bytes);
            }
            Ok(None) => {
                if let Err(e) = ring.abandon_fill(handle) {
                    spdlog::warn!("Source {} could not return its last slot: {}", source.name(), e);
                }
                spdlog::info!("Source {} has no more events", source.name());
                exhausted.store(true, Ordering::Release);
                break;
            }
            Err(e) => {
                if let Err(e) = ring.abandon_fill(handle) {
                    spdlog::warn!("Source {} could not return its last slot: {}", source.name(), e);
                }
                spdlog::error!("Source {} failed: {}", source.name(), e);
                fault.record(e);
                break;
            }
        }
    }
    control.mark_finished();
}

/// Deterministic event generator used for demonstrations and tests.
///
/// Every event carries a `pulse_energy` beamline value cycling through 1.0..1.9, a
/// gaussian pulse on digitizer channel 0 whose height scales with the energy, and a
/// patterned frame on pixel detector 0.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    name: String,
    limit: Option<u64>,
    produced: u64,
    start_timestamp: u32,
    invalid_every: Option<u64>,
    missing_beamline_every: Option<u64>,
    waveform_len: usize,
    frame_shape: (usize, usize),
    delay: Option<Duration>,
}

/// Fiducials per coarse timestamp tick
const FIDUCIALS_PER_TICK: u64 = 120;

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            name: String::from("synthetic"),
            limit: None,
            produced: 0,
            start_timestamp: time::OffsetDateTime::now_utc().unix_timestamp() as u32,
            invalid_every: None,
            missing_beamline_every: None,
            waveform_len: 256,
            frame_shape: (32, 32),
            delay: None,
        }
    }

    /// Stop after `limit` events
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_start_timestamp(mut self, timestamp: u32) -> Self {
        self.start_timestamp = timestamp;
        self
    }

    /// Flag every `n`th event as invalid
    pub fn with_invalid_every(mut self, n: u64) -> Self {
        self.invalid_every = Some(n.max(1));
        self
    }

    /// Leave out the beamline data of every `n`th event
    pub fn with_missing_beamline_every(mut self, n: u64) -> Self {
        self.missing_beamline_every = Some(n.max(1));
        self
    }

    /// Sleep between events to emulate a repetition rate
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// The id given to the `n`th (0 based) event
    pub fn id_of(&self, n: u64) -> EventId {
        EventId::from_parts(
            self.start_timestamp
                .wrapping_add((n / FIDUCIALS_PER_TICK) as u32),
            (n % FIDUCIALS_PER_TICK) as u32,
        )
    }
}

impl Source for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fill(&mut self, event: &mut Event) -> Result<Option<FillReport>, SourceError> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(None);
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let n = self.produced;
        self.produced += 1;
        let id = self.id_of(n);
        event.set_id(id);

        let energy = 1.0 + (n % 10) as f64 * 0.1;
        let skip_beamline = self
            .missing_beamline_every
            .is_some_and(|every| (n + 1) % every == 0);
        if !skip_beamline {
            event.set_beamline_value("pulse_energy", energy);
        }

        let center = self.waveform_len as f64 / 3.0;
        let sigma = 10.0;
        event
            .waveform_buffer(0)
            .samples
            .extend((0..self.waveform_len).map(|i| {
                let x = (i as f64 - center) / sigma;
                (8.0 * energy * (-0.5 * x * x).exp()) as f32
            }));

        for ((row, col), pixel) in event.frame_buffer(0, self.frame_shape).indexed_iter_mut() {
            *pixel = ((row + col + n as usize) % 16) as f32;
        }
        event.payload.extend_from_slice(&id.0.to_le_bytes());

        let bytes = (self.waveform_len * 4
            + self.frame_shape.0 * self.frame_shape.1 * 4
            + event.payload.len()) as u64;
        let valid = !self.invalid_every.is_some_and(|every| (n + 1) % every == 0);
        Ok(Some(FillReport { id, valid, bytes }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DeviceKind;
    use crate::ring::{Backpressure, SlotState};
    use crate::status::rate_channel;

    const TIMEOUT: Duration = Duration::from_millis(20);

    /// Fails after producing `good` events
    struct FlakySource {
        good: u64,
        produced: u64,
    }

    impl Source for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        fn fill(&mut self, event: &mut Event) -> Result<Option<FillReport>, SourceError> {
            if self.produced == self.good {
                return Err(SourceError::Fault {
                    name: String::from("flaky"),
                    message: String::from("connection lost"),
                });
            }
            self.produced += 1;
            let id = EventId(self.produced);
            event.set_id(id);
            Ok(Some(FillReport {
                id,
                valid: true,
                bytes: 8,
            }))
        }
    }

    fn drain(ring: &EventSlotRing, expected: usize) -> Vec<EventId> {
        let mut ids = Vec::new();
        while ids.len() < expected {
            if let Some(handle) = ring.acquire_processable(Duration::from_secs(5)) {
                ids.push(handle.id());
                ring.release_processed(handle).unwrap();
            } else {
                panic!("source stalled after {} events", ids.len());
            }
        }
        ids
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition never became true");
    }

    #[test]
    fn test_synthetic_event_contents() {
        let mut source = SyntheticSource::new()
            .with_start_timestamp(1000)
            .with_missing_beamline_every(2)
            .with_invalid_every(3);
        let mut event = Event::new();
        let first = source.fill(&mut event).unwrap().unwrap();
        assert_eq!(first.id, EventId::from_parts(1000, 0));
        assert!(first.valid);
        assert_eq!(event.beamline_value("pulse_energy"), Some(1.0));
        for kind in DeviceKind::ALL {
            assert!(event.has_device(kind));
        }

        event.reset();
        let second = source.fill(&mut event).unwrap().unwrap();
        assert!(!event.has_device(DeviceKind::Beamline));
        assert!(second.valid);

        event.reset();
        let third = source.fill(&mut event).unwrap().unwrap();
        assert!(!third.valid);
        assert!(first.id < second.id && second.id < third.id);
        assert_eq!(source.id_of(121), EventId::from_parts(1001, 1));
    }

    #[test]
    fn test_runner_fills_until_exhausted() {
        let ring = Arc::new(EventSlotRing::new(2, Backpressure::Block).unwrap());
        let (reporter, mut aggregator) = rate_channel();
        let mut runner = SourceRunner::new(Box::new(
            SyntheticSource::new().with_start_timestamp(5).with_limit(6),
        ));
        runner.start(ring.clone(), reporter, TIMEOUT).unwrap();

        let ids = drain(&ring, 6);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        wait_for(|| runner.is_exhausted());
        runner.stop().unwrap();
        assert!(!runner.has_fault());
        assert_eq!(ring.statistics().filled, 6);
        assert_eq!(ring.count_in(SlotState::Free), 2);

        aggregator.poll();
        assert_eq!(aggregator.totals(Origin::Source).count, 6);
    }

    #[test]
    fn test_runner_records_fault() {
        let ring = Arc::new(EventSlotRing::new(4, Backpressure::Block).unwrap());
        let mut runner = SourceRunner::new(Box::new(FlakySource {
            good: 2,
            produced: 0,
        }));
        runner
            .start(ring.clone(), RateReporter::disabled(), TIMEOUT)
            .unwrap();
        wait_for(|| !runner.is_running());
        assert!(runner.has_fault());
        assert!(matches!(
            runner.take_fault(),
            Some(SourceError::Fault { .. })
        ));
        // the slot being filled when the fault hit went back to Free
        assert_eq!(ring.count_in(SlotState::Filling), 0);
        assert_eq!(drain(&ring, 2), vec![EventId(1), EventId(2)]);
        runner.stop().unwrap();
    }

    #[test]
    fn test_runner_pauses() {
        let ring = Arc::new(EventSlotRing::new(512, Backpressure::Block).unwrap());
        let mut runner = SourceRunner::new(Box::new(
            SyntheticSource::new().with_delay(Duration::from_millis(1)),
        ));
        runner
            .start(ring.clone(), RateReporter::disabled(), TIMEOUT)
            .unwrap();
        wait_for(|| ring.statistics().filled > 0);
        runner.control().request_pause(true).unwrap();
        let frozen = ring.statistics().filled;
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(ring.statistics().filled, frozen);
        runner.control().resume().unwrap();
        wait_for(|| ring.statistics().filled > frozen);
        runner.stop().unwrap();
    }
}
