use fxhash::{FxHashMap, FxHashSet};
use ndarray::Array2;
use std::fmt;

/// 64-bit event identifier.
///
/// The high 32 bits carry a coarse timestamp (seconds), the low 32 bits a sub-tick
/// (fiducial) counter. Ordering of ids therefore follows acquisition time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u64);

impl EventId {
    pub fn from_parts(timestamp: u32, fiducial: u32) -> Self {
        Self(((timestamp as u64) << 32) | fiducial as u64)
    }

    pub fn timestamp(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn fiducial(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp(), self.fiducial())
    }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// The fixed set of device containers carried by every Event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    PixelDetector,
    Digitizer,
    Beamline,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [
        DeviceKind::PixelDetector,
        DeviceKind::Digitizer,
        DeviceKind::Beamline,
    ];

    fn index(&self) -> usize {
        match self {
            DeviceKind::PixelDetector => 0,
            DeviceKind::Digitizer => 1,
            DeviceKind::Beamline => 2,
        }
    }
}

/// A single digitizer channel trace. Physical value is `gain * sample + offset`.
#[derive(Debug, Clone, Default)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub gain: f64,
    pub offset: f64,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, gain: f64, offset: f64) -> Self {
        Self {
            samples,
            gain,
            offset,
        }
    }
}

/// Pixel detector frames keyed by detector number. Only detectors in `live` were
/// written during the current fill; the others are buffers kept from earlier fills.
#[derive(Debug, Clone, Default)]
pub struct PixelDetectors {
    frames: FxHashMap<usize, Array2<f32>>,
    live: FxHashSet<usize>,
}

/// Digitizer waveforms keyed by channel, with the same live/kept split as frames
#[derive(Debug, Clone, Default)]
pub struct Digitizer {
    channels: FxHashMap<usize, Waveform>,
    live: FxHashSet<usize>,
}

/// Scalar machine/beamline values keyed by name. `None` means not set in this fill.
#[derive(Debug, Clone, Default)]
pub struct Beamline {
    values: FxHashMap<String, Option<f64>>,
}

/// One unit of pipeline work.
///
/// Events are allocated once when the EventSlotRing is built and recycled for the
/// life of the ring. The filler calls [`Event::reset`] before populating an event;
/// reset keeps the allocations of the device containers around for the next fill.
#[derive(Debug, Clone, Default)]
pub struct Event {
    id: EventId,
    pub payload: Vec<u8>,
    detectors: PixelDetectors,
    digitizer: Digitizer,
    beamline: Beamline,
    present: [bool; 3],
    byte_count: u64,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn set_id(&mut self, id: EventId) {
        self.id = id;
    }

    /// Bytes reported by the source which filled this event
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn set_byte_count(&mut self, bytes: u64) {
        self.byte_count = bytes;
    }

    pub fn has_device(&self, kind: DeviceKind) -> bool {
        self.present[kind.index()]
    }

    pub fn mark_device(&mut self, kind: DeviceKind) {
        self.present[kind.index()] = true;
    }

    /// Replace the frame of `detector`, dropping any kept buffer
    pub fn set_frame(&mut self, detector: usize, frame: Array2<f32>) {
        self.detectors.frames.insert(detector, frame);
        self.detectors.live.insert(detector);
        self.mark_device(DeviceKind::PixelDetector);
    }

    /// The frame of `detector` to be written in place. A kept buffer of the same
    /// shape is reused as is (old pixel values included); otherwise a zeroed one is made.
    pub fn frame_buffer(&mut self, detector: usize, shape: (usize, usize)) -> &mut Array2<f32> {
        self.mark_device(DeviceKind::PixelDetector);
        self.detectors.live.insert(detector);
        let frame = self
            .detectors
            .frames
            .entry(detector)
            .or_insert_with(|| Array2::zeros(shape));
        if frame.dim() != shape {
            *frame = Array2::zeros(shape);
        }
        frame
    }

    /// Replace the waveform of `channel`, dropping any kept buffer
    pub fn set_waveform(&mut self, channel: usize, waveform: Waveform) {
        self.digitizer.channels.insert(channel, waveform);
        self.digitizer.live.insert(channel);
        self.mark_device(DeviceKind::Digitizer);
    }

    /// The waveform of `channel` with no samples, unit gain and zero offset. The sample
    /// allocation of a kept buffer is reused.
    pub fn waveform_buffer(&mut self, channel: usize) -> &mut Waveform {
        self.mark_device(DeviceKind::Digitizer);
        self.digitizer.live.insert(channel);
        let waveform = self.digitizer.channels.entry(channel).or_default();
        waveform.samples.clear();
        waveform.gain = 1.0;
        waveform.offset = 0.0;
        waveform
    }

    pub fn set_beamline_value(&mut self, key: &str, value: f64) {
        match self.beamline.values.get_mut(key) {
            Some(v) => *v = Some(value),
            None => {
                self.beamline.values.insert(key.to_string(), Some(value));
            }
        }
        self.mark_device(DeviceKind::Beamline);
    }

    pub fn frame(&self, detector: usize) -> Option<&Array2<f32>> {
        if !self.detectors.live.contains(&detector) {
            return None;
        }
        self.detectors.frames.get(&detector)
    }

    pub fn waveform(&self, channel: usize) -> Option<&Waveform> {
        if !self.digitizer.live.contains(&channel) {
            return None;
        }
        self.digitizer.channels.get(&channel)
    }

    pub fn beamline_value(&self, key: &str) -> Option<f64> {
        self.beamline.values.get(key).copied().flatten()
    }

    /// Clear the event for the next fill cycle. Buffers and keys stay allocated.
    pub fn reset(&mut self) {
        self.id = EventId::default();
        self.payload.clear();
        self.detectors.live.clear();
        self.digitizer.live.clear();
        for value in self.beamline.values.values_mut() {
            *value = None;
        }
        self.present = [false; 3];
        self.byte_count = 0;
    }
}
