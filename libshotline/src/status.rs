use fxhash::FxHashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use time::OffsetDateTime;

/// Who completed the work described by a RateSample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Source,
    Worker(usize),
}

/// Completions reported by a source or worker
#[derive(Debug, Clone)]
pub struct RateSample {
    pub origin: Origin,
    pub count: u64,
    pub bytes: u64,
    pub timestamp: OffsetDateTime,
}

impl RateSample {
    pub fn new(origin: Origin, count: u64, bytes: u64) -> Self {
        Self {
            origin,
            count,
            bytes,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Sending half handed to sources and workers. A reporter without a channel drops
/// every sample.
#[derive(Debug, Clone, Default)]
pub struct RateReporter {
    tx: Option<Sender<RateSample>>,
}

impl RateReporter {
    pub fn new(tx: Sender<RateSample>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, origin: Origin, count: u64, bytes: u64) {
        if let Some(tx) = &self.tx {
            // A dropped aggregator only means nobody is watching the rates
            if tx.send(RateSample::new(origin, count, bytes)).is_err() {
                spdlog::trace!("Rate sample from {:?} dropped", origin);
            }
        }
    }
}

/// Create a connected reporter/aggregator pair
pub fn rate_channel() -> (RateReporter, RateAggregator) {
    let (tx, rx) = mpsc::channel::<RateSample>();
    (RateReporter::new(tx), RateAggregator::new(rx))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub count: u64,
    pub bytes: u64,
}

/// Rates over the interval since the previous snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct RateSnapshot {
    pub source_rate: f64,
    pub source_byte_rate: f64,
    pub worker_rate: f64,
    pub worker_byte_rate: f64,
    pub source_total: Totals,
    pub worker_total: Totals,
}

impl RateSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "filled {} ({:.1} ev/s, {}/s) processed {} ({:.1} ev/s, {}/s)",
            self.source_total.count,
            self.source_rate,
            human_bytes::human_bytes(self.source_byte_rate),
            self.worker_total.count,
            self.worker_rate,
            human_bytes::human_bytes(self.worker_byte_rate),
        )
    }
}

/// Receiving half: folds samples into per-origin totals and interval rates
#[derive(Debug)]
pub struct RateAggregator {
    rx: Receiver<RateSample>,
    totals: FxHashMap<Origin, Totals>,
    interval: FxHashMap<Origin, Totals>,
    interval_start: OffsetDateTime,
}

impl RateAggregator {
    pub fn new(rx: Receiver<RateSample>) -> Self {
        Self {
            rx,
            totals: FxHashMap::default(),
            interval: FxHashMap::default(),
            interval_start: OffsetDateTime::now_utc(),
        }
    }

    /// Drain every pending sample. Returns the number of samples read.
    pub fn poll(&mut self) -> usize {
        let mut n_samples = 0;
        while let Ok(sample) = self.rx.try_recv() {
            for map in [&mut self.totals, &mut self.interval] {
                let entry = map.entry(sample.origin).or_default();
                entry.count += sample.count;
                entry.bytes += sample.bytes;
            }
            n_samples += 1;
        }
        n_samples
    }

    pub fn totals(&self, origin: Origin) -> Totals {
        self.totals.get(&origin).copied().unwrap_or_default()
    }

    fn sum(map: &FxHashMap<Origin, Totals>, source: bool) -> Totals {
        map.iter()
            .filter(|(origin, _)| (**origin == Origin::Source) == source)
            .fold(Totals::default(), |acc, (_, t)| Totals {
                count: acc.count + t.count,
                bytes: acc.bytes + t.bytes,
            })
    }

    /// Poll, then compute rates since the previous snapshot and start a new interval
    pub fn snapshot(&mut self) -> RateSnapshot {
        self.poll();
        let now = OffsetDateTime::now_utc();
        let elapsed = (now - self.interval_start).as_seconds_f64().max(1e-6);
        let source = Self::sum(&self.interval, true);
        let workers = Self::sum(&self.interval, false);
        self.interval.clear();
        self.interval_start = now;
        RateSnapshot {
            source_rate: source.count as f64 / elapsed,
            source_byte_rate: source.bytes as f64 / elapsed,
            worker_rate: workers.count as f64 / elapsed,
            worker_byte_rate: workers.bytes as f64 / elapsed,
            source_total: Self::sum(&self.totals, true),
            worker_total: Self::sum(&self.totals, false),
        }
    }
}
