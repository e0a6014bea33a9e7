use std::sync::Arc;

use super::builtin::build_graph;
use super::config::Config;
use super::error::{GraphError, PipelineError, WorkerError};
use super::graph::ComputationGraph;
use super::ring::{EventSlotRing, RingStatistics};
use super::source::{Source, SourceRunner};
use super::status::{rate_channel, RateAggregator, RateReporter};
use super::worker::WorkerPool;

/// Builds the ComputationGraph for a Config, at startup and on every reload
pub type GraphBuilder = Box<dyn Fn(&Config) -> Result<ComputationGraph, GraphError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    SourceExhausted,
}

/// Owns the ring, the source thread and the worker pool, and propagates their faults.
///
/// The owner is expected to call [`Pipeline::poll`] periodically. A fault in the source
/// or any worker stops the source, drains what is left in the ring (bounded by the
/// configured drain timeout), ends the workers and is returned from `poll`.
pub struct Pipeline {
    config: Config,
    builder: GraphBuilder,
    ring: Arc<EventSlotRing>,
    source: SourceRunner,
    pool: WorkerPool,
    reporter: RateReporter,
    rates: Option<RateAggregator>,
    started: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("ring", &self.ring)
            .field("source", &self.source)
            .field("pool", &self.pool)
            .field("started", &self.started)
            .finish()
    }
}

impl Pipeline {
    /// Create a pipeline whose graph is made of the built-in processors in `config`
    pub fn new(config: Config, source: Box<dyn Source>) -> Result<Self, PipelineError> {
        Self::with_graph_builder(config, source, build_graph)
    }

    /// Create a pipeline with a custom graph builder
    pub fn with_graph_builder(
        config: Config,
        source: Box<dyn Source>,
        builder: impl Fn(&Config) -> Result<ComputationGraph, GraphError> + Send + 'static,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let builder: GraphBuilder = Box::new(builder);
        let ring = Arc::new(EventSlotRing::new(
            config.ring_capacity,
            config.backpressure,
        )?);
        let graph = builder(&config)?;
        let (reporter, rates) = rate_channel();
        let pool = WorkerPool::new(
            ring.clone(),
            graph,
            reporter.clone(),
            config.acquire_timeout(),
        );
        Ok(Self {
            config,
            builder,
            ring,
            source: SourceRunner::new(source),
            pool,
            reporter,
            rates: Some(rates),
            started: false,
        })
    }

    /// Spawn the workers, then the source
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.started {
            return Ok(());
        }
        self.pool.start(self.config.n_workers)?;
        self.source.start(
            self.ring.clone(),
            self.reporter.clone(),
            self.config.acquire_timeout(),
        )?;
        self.started = true;
        spdlog::info!(
            "Pipeline started with source {}, {} workers and a ring of {} slots",
            self.source.name(),
            self.config.n_workers,
            self.ring.capacity()
        );
        Ok(())
    }

    /// Check the source and the workers. Any fault winds the pipeline down and is returned.
    pub fn poll(&mut self) -> Result<PipelineState, PipelineError> {
        if !self.started {
            return Err(PipelineError::NotStarted);
        }
        let vanished = self.pool.len() - self.pool.running();
        if self.source.has_fault() || self.pool.has_fault() || vanished > 0 {
            spdlog::error!("Pipeline detected a fault, shutting down");
            self.wind_down()?;
            return Err(WorkerError::Vanished(vanished).into());
        }
        if self.source.is_exhausted() {
            Ok(PipelineState::SourceExhausted)
        } else {
            Ok(PipelineState::Running)
        }
    }

    /// Apply a new configuration without losing events.
    ///
    /// The source and the workers are paused, the graph is rebuilt from `config` and the
    /// worker count adjusted. Ring capacity and backpressure are fixed for the life of
    /// the pipeline; changes to them are ignored with a warning.
    pub fn reload(&mut self, mut config: Config) -> Result<(), PipelineError> {
        config.validate()?;
        if config.ring_capacity != self.ring.capacity()
            || config.backpressure != self.ring.policy()
        {
            spdlog::warn!(
                "Ring capacity and backpressure cannot change while running, keeping {} slots with {:?}",
                self.ring.capacity(),
                self.ring.policy()
            );
            config.ring_capacity = self.ring.capacity();
            config.backpressure = self.ring.policy();
        }
        let graph = (self.builder)(&config)?;

        if !self.started {
            self.pool = WorkerPool::new(
                self.ring.clone(),
                graph,
                self.reporter.clone(),
                config.acquire_timeout(),
            );
            self.config = config;
            return Ok(());
        }

        spdlog::info!("Reloading pipeline configuration");
        self.source.control().request_pause(true)?;
        let reloaded =
            self.pool
                .reload_configuration(graph, config.n_workers, config.acquire_timeout());
        self.source.control().resume()?;
        reloaded?;
        self.config = config;
        Ok(())
    }

    /// Wait for the source to run out of events, then process what is left and stop.
    /// Never returns for a source without an end.
    pub fn finish(&mut self) -> Result<(), PipelineError> {
        loop {
            match self.poll()? {
                PipelineState::SourceExhausted => break,
                PipelineState::Running => std::thread::sleep(self.config.acquire_timeout()),
            }
        }
        spdlog::info!("Source exhausted, finishing pipeline");
        self.wind_down()
    }

    /// Stop the source now, process what is already in the ring and stop the workers
    pub fn shutdown(&mut self) -> Result<(), PipelineError> {
        if !self.started {
            return Ok(());
        }
        spdlog::info!("Shutting down pipeline");
        self.wind_down()
    }

    /// Stop source, drain, end workers. Faults take precedence over join errors.
    fn wind_down(&mut self) -> Result<(), PipelineError> {
        self.started = false;
        let source_stopped = self.source.stop();
        if !self.ring.drain_until_empty_for(self.config.drain_timeout()) {
            spdlog::warn!(
                "Ring did not drain within {} ms, unprocessed events are dropped",
                self.config.drain_timeout_ms
            );
        }
        let workers_ended = self.pool.end();
        spdlog::info!("Pipeline stopped -- {:?}", self.ring.statistics());

        if let Some(fault) = self.source.take_fault() {
            return Err(fault.into());
        }
        if let Some(fault) = self.pool.take_fault() {
            return Err(fault.into());
        }
        source_stopped?;
        workers_ended?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// The ring, e.g. to attach viewers
    pub fn ring(&self) -> &Arc<EventSlotRing> {
        &self.ring
    }

    /// The graph currently used by the workers
    pub fn graph(&self) -> Arc<ComputationGraph> {
        self.pool.graph()
    }

    pub fn statistics(&self) -> RingStatistics {
        self.ring.statistics()
    }

    pub fn n_workers(&self) -> usize {
        self.pool.len()
    }

    /// Hand the rate aggregator to whoever displays progress. Only available once.
    pub fn take_rates(&mut self) -> Option<RateAggregator> {
        self.rates.take()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.started {
            if let Err(e) = self.wind_down() {
                spdlog::error!("Pipeline dropped while running: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ComputeError, SourceError};
    use crate::event::{Event, EventId};
    use crate::processor::{Inputs, Processor};
    use crate::result::{ResultStatus, Value};
    use crate::ring::ViewSelector;
    use crate::source::{FillReport, SyntheticSource};
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Yields ids 1..=count, then either ends or fails
    struct CountingSource {
        count: u64,
        produced: u64,
        fail_at_end: bool,
    }

    impl Source for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        fn fill(&mut self, event: &mut Event) -> Result<Option<FillReport>, SourceError> {
            if self.produced == self.count {
                if self.fail_at_end {
                    return Err(SourceError::Fault {
                        name: String::from("counting"),
                        message: String::from("device went away"),
                    });
                }
                return Ok(None);
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

    fn counting(count: u64) -> Box<dyn Source> {
        Box::new(CountingSource {
            count,
            produced: 0,
            fail_at_end: false,
        })
    }

    /// Records every event id it sees, failing on `fail_on`
    struct Recorder {
        seen: Arc<Mutex<Vec<EventId>>>,
        fail_on: Option<EventId>,
    }

    impl Processor for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn compute(&self, event: &Event, _inputs: &Inputs<'_>) -> Result<Value, ComputeError> {
            if self.fail_on == Some(event.id()) {
                return Err(ComputeError::Fatal(String::from("recorder broke")));
            }
            self.seen.lock().push(event.id());
            Ok(Value::Scalar(event.id().0 as f64))
        }
    }

    fn recorder_builder(
        seen: &Arc<Mutex<Vec<EventId>>>,
        fail_on: Option<EventId>,
    ) -> impl Fn(&Config) -> Result<ComputationGraph, GraphError> + Send + 'static {
        let seen = seen.clone();
        move |config: &Config| {
            ComputationGraph::from_processors(
                vec![Box::new(Recorder {
                    seen: seen.clone(),
                    fail_on,
                })],
                config.effective_cache_depth(),
            )
        }
    }

    fn test_config(n_workers: usize) -> Config {
        Config {
            ring_capacity: 4,
            n_workers,
            acquire_timeout_ms: 10,
            drain_timeout_ms: 300,
            ..Default::default()
        }
    }

    fn poll_until_error(pipeline: &mut Pipeline) -> PipelineError {
        for _ in 0..500 {
            match pipeline.poll() {
                Ok(_) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => return e,
            }
        }
        panic!("pipeline never reported a fault");
    }

    #[test]
    fn test_single_worker_sees_ids_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::with_graph_builder(
            test_config(1),
            counting(10),
            recorder_builder(&seen, None),
        )
        .unwrap();
        pipeline.start().unwrap();
        pipeline.finish().unwrap();
        let expected: Vec<EventId> = (1..=10).map(EventId).collect();
        assert_eq!(*seen.lock(), expected);
        let stats = pipeline.statistics();
        assert_eq!(stats.filled, 10);
        assert_eq!(stats.processed, 10);
    }

    #[test]
    fn test_builtin_graph_on_synthetic_events() {
        let source = SyntheticSource::new().with_start_timestamp(7).with_limit(10);
        let ids = source.clone();
        let config = Config {
            acquire_timeout_ms: 10,
            cache_depth: Some(16),
            ..Default::default()
        };
        let mut pipeline = Pipeline::new(config, Box::new(source)).unwrap();
        let mut rates = pipeline.take_rates().unwrap();
        assert!(pipeline.take_rates().is_none());
        pipeline.start().unwrap();
        pipeline.finish().unwrap();

        let graph = pipeline.graph();
        assert!(graph.data_errors().is_empty());
        let energy = graph.cached("pulse_energy", ids.id_of(9)).unwrap();
        assert!((energy.value().as_scalar().unwrap() - 1.9).abs() < 1e-9);
        let normalized = graph
            .cached("tof_per_energy", ids.id_of(9))
            .unwrap()
            .value()
            .as_scalar()
            .unwrap();
        assert!((190.0..210.0).contains(&normalized));
        // pulse energy 1.0 is below the beam threshold
        let skipped = graph.cached("tof_integral", ids.id_of(0)).unwrap();
        assert_eq!(skipped.status(), ResultStatus::Skipped);

        let snapshot = rates.snapshot();
        assert_eq!(snapshot.source_total.count, 10);
        assert_eq!(snapshot.worker_total.count, 10);
    }

    #[test]
    fn test_source_fault_is_reraised() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let source = Box::new(CountingSource {
            count: 3,
            produced: 0,
            fail_at_end: true,
        });
        let mut pipeline =
            Pipeline::with_graph_builder(test_config(2), source, recorder_builder(&seen, None))
                .unwrap();
        pipeline.start().unwrap();
        let error = poll_until_error(&mut pipeline);
        assert!(matches!(
            error,
            PipelineError::SourceError(SourceError::Fault { .. })
        ));
        // events filled before the fault were still processed
        assert_eq!(seen.lock().len(), 3);
        assert!(!pipeline.is_started());
        assert!(matches!(pipeline.poll(), Err(PipelineError::NotStarted)));
    }

    #[test]
    fn test_worker_fault_is_reraised() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::with_graph_builder(
            test_config(1),
            counting(20),
            recorder_builder(&seen, Some(EventId(5))),
        )
        .unwrap();
        pipeline.start().unwrap();
        let error = poll_until_error(&mut pipeline);
        match error {
            PipelineError::WorkerError(WorkerError::GraphError { source, .. }) => {
                assert!(matches!(source, GraphError::Fatal { event: EventId(5), .. }))
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(pipeline.n_workers(), 0);
    }

    #[test]
    fn test_reload_keeps_every_event() {
        let config = Config {
            acquire_timeout_ms: 10,
            ..Default::default()
        };
        let source = SyntheticSource::new().with_delay(Duration::from_millis(1));
        let mut pipeline = Pipeline::new(config.clone(), Box::new(source)).unwrap();
        pipeline.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pipeline.poll().unwrap(), PipelineState::Running);

        let mut reloaded = config.clone();
        reloaded.n_workers = 3;
        reloaded.ring_capacity = 64;
        reloaded.processors.truncate(1);
        pipeline.reload(reloaded).unwrap();
        assert_eq!(pipeline.n_workers(), 3);
        assert_eq!(pipeline.graph().names(), vec!["pulse_energy"]);
        assert_eq!(pipeline.config().ring_capacity, config.ring_capacity);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pipeline.poll().unwrap(), PipelineState::Running);
        pipeline.shutdown().unwrap();
        let stats = pipeline.statistics();
        assert!(stats.filled > 0);
        assert_eq!(stats.filled, stats.processed);
    }

    #[test]
    fn test_viewer_reads_live_events() {
        let config = Config {
            acquire_timeout_ms: 10,
            ..Default::default()
        };
        let source = SyntheticSource::new().with_delay(Duration::from_millis(1));
        let mut pipeline = Pipeline::new(config, Box::new(source)).unwrap();
        pipeline.start().unwrap();
        let ring = pipeline.ring().clone();
        let view = ring
            .acquire_view(&ViewSelector::Latest, Duration::from_secs(5))
            .unwrap();
        let energy = ring.read_event(&view).beamline_value("pulse_energy");
        assert!(energy.is_some());
        ring.release_view(view).unwrap();
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_poll_before_start() {
        let mut pipeline = Pipeline::new(test_config(1), counting(1)).unwrap();
        assert!(matches!(pipeline.poll(), Err(PipelineError::NotStarted)));
        pipeline.shutdown().unwrap();
    }
}
