//! The processors which can be declared in a configuration file.
//!
//! Each one is a small [`Processor`] implementation; [`build_graph`] turns the
//! processor list of a [`Config`] into a resolved [`ComputationGraph`].
use parking_lot::Mutex;

use super::config::{ArithmeticOp, CompareOp, Config, Operation, ProcessorConfig};
use super::error::{ComputeError, GraphError};
use super::event::Event;
use super::graph::ComputationGraph;
use super::processor::{Inputs, Processor};
use super::result::Value;

/// Build the ComputationGraph described by the processor list of `config`
pub fn build_graph(config: &Config) -> Result<ComputationGraph, GraphError> {
    let processors = config
        .processors
        .iter()
        .map(build_processor)
        .collect::<Result<Vec<Box<dyn Processor>>, GraphError>>()?;
    ComputationGraph::from_processors(processors, config.effective_cache_depth())
}

/// Instantiate a single built-in processor
pub fn build_processor(config: &ProcessorConfig) -> Result<Box<dyn Processor>, GraphError> {
    let bad = |message: &str| GraphError::BadProcessorConfig {
        node: config.name.clone(),
        message: message.to_string(),
    };
    let common = Common {
        name: config.name.clone(),
        condition: config.condition.clone(),
    };
    let processor: Box<dyn Processor> = match &config.operation {
        Operation::Constant { value } => Box::new(Constant {
            common,
            value: *value,
        }),
        Operation::BeamlineValue { key } => Box::new(BeamlineValue {
            common,
            key: key.clone(),
        }),
        Operation::WaveformIntegral {
            channel,
            first_sample,
            last_sample,
        } => {
            if let Some(last) = last_sample {
                if last < first_sample {
                    return Err(bad("last_sample is before first_sample"));
                }
            }
            Box::new(WaveformIntegral {
                common,
                channel: *channel,
                first_sample: *first_sample,
                last_sample: *last_sample,
            })
        }
        Operation::FrameSum { detector } => Box::new(FrameSum {
            common,
            detector: *detector,
        }),
        Operation::Compare {
            input,
            op,
            threshold,
        } => Box::new(Compare {
            common,
            input: input.clone(),
            op: *op,
            threshold: *threshold,
        }),
        Operation::Arithmetic { lhs, rhs, op } => Box::new(Arithmetic {
            common,
            inputs: vec![lhs.clone(), rhs.clone()],
            op: *op,
        }),
        Operation::Histogram {
            input,
            bins,
            min,
            max,
        } => {
            if *bins == 0 {
                return Err(bad("histogram needs at least one bin"));
            }
            if max <= min {
                return Err(bad("histogram max must be greater than min"));
            }
            Box::new(Histogram {
                common,
                input: input.clone(),
                min: *min,
                max: *max,
                counts: Mutex::new(vec![0.0; *bins]),
            })
        }
    };
    Ok(processor)
}

#[derive(Debug, Clone)]
struct Common {
    name: String,
    condition: Option<String>,
}

#[derive(Debug)]
struct Constant {
    common: Common,
    value: f64,
}

impl Processor for Constant {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn condition(&self) -> Option<String> {
        self.common.condition.clone()
    }

    fn compute(&self, _event: &Event, _inputs: &Inputs<'_>) -> Result<Value, ComputeError> {
        Ok(Value::Scalar(self.value))
    }
}

#[derive(Debug)]
struct BeamlineValue {
    common: Common,
    key: String,
}

impl Processor for BeamlineValue {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn condition(&self) -> Option<String> {
        self.common.condition.clone()
    }

    fn compute(&self, event: &Event, _inputs: &Inputs<'_>) -> Result<Value, ComputeError> {
        event
            .beamline_value(&self.key)
            .map(Value::Scalar)
            .ok_or_else(|| ComputeError::Data(format!("beamline value {} missing", self.key)))
    }
}

/// Sum of `gain * sample + offset` over an inclusive sample range
#[derive(Debug)]
struct WaveformIntegral {
    common: Common,
    channel: usize,
    first_sample: usize,
    last_sample: Option<usize>,
}

impl Processor for WaveformIntegral {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn condition(&self) -> Option<String> {
        self.common.condition.clone()
    }

    fn compute(&self, event: &Event, _inputs: &Inputs<'_>) -> Result<Value, ComputeError> {
        let waveform = event.waveform(self.channel).ok_or_else(|| {
            ComputeError::Data(format!("digitizer channel {} missing", self.channel))
        })?;
        let n_samples = waveform.samples.len();
        let last = self
            .last_sample
            .unwrap_or(n_samples.saturating_sub(1))
            .min(n_samples.saturating_sub(1));
        if n_samples == 0 || self.first_sample > last {
            return Err(ComputeError::Data(format!(
                "digitizer channel {} has {} samples, range starts at {}",
                self.channel, n_samples, self.first_sample
            )));
        }
        let integral = waveform.samples[self.first_sample..=last]
            .iter()
            .fold(0.0, |sum, s| {
                sum + waveform.gain * (*s as f64) + waveform.offset
            });
        Ok(Value::Scalar(integral))
    }
}

#[derive(Debug)]
struct FrameSum {
    common: Common,
    detector: usize,
}

impl Processor for FrameSum {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn condition(&self) -> Option<String> {
        self.common.condition.clone()
    }

    fn compute(&self, event: &Event, _inputs: &Inputs<'_>) -> Result<Value, ComputeError> {
        let frame = event.frame(self.detector).ok_or_else(|| {
            ComputeError::Data(format!("pixel detector {} missing", self.detector))
        })?;
        Ok(Value::Scalar(frame.iter().map(|p| *p as f64).sum()))
    }
}

/// 1.0 when `input op threshold` holds, otherwise 0.0
#[derive(Debug)]
struct Compare {
    common: Common,
    input: String,
    op: CompareOp,
    threshold: f64,
}

impl Processor for Compare {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.input.clone()]
    }

    fn condition(&self) -> Option<String> {
        self.common.condition.clone()
    }

    fn compute(&self, _event: &Event, inputs: &Inputs<'_>) -> Result<Value, ComputeError> {
        let value = inputs.scalar(0)?;
        let pass = match self.op {
            CompareOp::Less => value < self.threshold,
            CompareOp::LessEqual => value <= self.threshold,
            CompareOp::Greater => value > self.threshold,
            CompareOp::GreaterEqual => value >= self.threshold,
            CompareOp::Equal => value == self.threshold,
            CompareOp::NotEqual => value != self.threshold,
        };
        Ok(Value::Scalar(if pass { 1.0 } else { 0.0 }))
    }
}

#[derive(Debug)]
struct Arithmetic {
    common: Common,
    inputs: Vec<String>,
    op: ArithmeticOp,
}

impl Processor for Arithmetic {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn condition(&self) -> Option<String> {
        self.common.condition.clone()
    }

    fn compute(&self, _event: &Event, inputs: &Inputs<'_>) -> Result<Value, ComputeError> {
        let lhs = inputs.scalar(0)?;
        let rhs = inputs.scalar(1)?;
        let value = match self.op {
            ArithmeticOp::Add => lhs + rhs,
            ArithmeticOp::Subtract => lhs - rhs,
            ArithmeticOp::Multiply => lhs * rhs,
            ArithmeticOp::Divide => {
                if rhs == 0.0 {
                    return Err(ComputeError::Data(format!(
                        "division by zero ({} is 0)",
                        self.inputs[1]
                    )));
                }
                lhs / rhs
            }
        };
        Ok(Value::Scalar(value))
    }
}

/// Accumulating 1D histogram. Values outside `[min, max)` are dropped.
#[derive(Debug)]
struct Histogram {
    common: Common,
    input: String,
    min: f64,
    max: f64,
    counts: Mutex<Vec<f64>>,
}

impl Processor for Histogram {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.input.clone()]
    }

    fn condition(&self) -> Option<String> {
        self.common.condition.clone()
    }

    fn compute(&self, _event: &Event, inputs: &Inputs<'_>) -> Result<Value, ComputeError> {
        let value = inputs.scalar(0)?;
        let mut counts = self.counts.lock();
        if value >= self.min && value < self.max {
            let width = (self.max - self.min) / counts.len() as f64;
            let bin = (((value - self.min) / width) as usize).min(counts.len() - 1);
            counts[bin] += 1.0;
        }
        Ok(Value::Vector(counts.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventId, Waveform};
    use crate::result::ResultStatus;
    use ndarray::Array2;

    fn processor(name: &str, condition: Option<&str>, operation: Operation) -> ProcessorConfig {
        ProcessorConfig {
            name: name.to_string(),
            condition: condition.map(|c| c.to_string()),
            operation,
        }
    }

    fn config(processors: Vec<ProcessorConfig>) -> Config {
        Config {
            processors,
            ..Default::default()
        }
    }

    fn event(id: u64, energy: Option<f64>) -> Event {
        let mut event = Event::new();
        event.set_id(EventId(id));
        if let Some(e) = energy {
            event.set_beamline_value("energy", e);
        }
        event.set_waveform(2, Waveform::new(vec![1.0, 2.0, 3.0, 4.0], 2.0, 0.5));
        event.set_frame(0, Array2::from_elem((4, 4), 0.5));
        event
    }

    #[test]
    fn test_default_config_builds() {
        let graph = build_graph(&Config::default()).unwrap();
        assert_eq!(graph.len(), Config::default().processors.len());
        assert!(graph.contains("tof_histogram"));
    }

    #[test]
    fn test_device_readers() {
        let graph = build_graph(&config(vec![
            processor(
                "energy",
                None,
                Operation::BeamlineValue {
                    key: String::from("energy"),
                },
            ),
            processor(
                "integral",
                None,
                Operation::WaveformIntegral {
                    channel: 2,
                    first_sample: 1,
                    last_sample: Some(2),
                },
            ),
            processor(
                "full_integral",
                None,
                Operation::WaveformIntegral {
                    channel: 2,
                    first_sample: 0,
                    last_sample: None,
                },
            ),
            processor("frame", None, Operation::FrameSum { detector: 0 }),
            processor("no_frame", None, Operation::FrameSum { detector: 9 }),
        ]))
        .unwrap();
        let ev = event(1, Some(2.5));
        assert_eq!(graph.result("energy", &ev).unwrap().value(), Value::Scalar(2.5));
        // (2*2 + 0.5) + (2*3 + 0.5)
        assert_eq!(graph.result("integral", &ev).unwrap().value(), Value::Scalar(11.0));
        assert_eq!(
            graph.result("full_integral", &ev).unwrap().value(),
            Value::Scalar(22.0)
        );
        assert_eq!(graph.result("frame", &ev).unwrap().value(), Value::Scalar(8.0));
        assert!(graph.result("no_frame", &ev).unwrap().is_unavailable());

        let missing = event(2, None);
        assert!(graph.result("energy", &missing).unwrap().is_unavailable());
    }

    #[test]
    fn test_compare_gates_arithmetic() {
        let graph = build_graph(&config(vec![
            processor(
                "energy",
                None,
                Operation::BeamlineValue {
                    key: String::from("energy"),
                },
            ),
            processor("two", None, Operation::Constant { value: 2.0 }),
            processor(
                "bright",
                None,
                Operation::Compare {
                    input: String::from("energy"),
                    op: CompareOp::Greater,
                    threshold: 1.0,
                },
            ),
            processor(
                "scaled",
                Some("bright"),
                Operation::Arithmetic {
                    lhs: String::from("energy"),
                    rhs: String::from("two"),
                    op: ArithmeticOp::Multiply,
                },
            ),
        ]))
        .unwrap();

        let bright = event(1, Some(3.0));
        assert_eq!(graph.result("scaled", &bright).unwrap().value(), Value::Scalar(6.0));

        let dim = event(2, Some(0.5));
        assert_eq!(
            graph.result("scaled", &dim).unwrap().status(),
            ResultStatus::Skipped
        );
    }

    #[test]
    fn test_division_by_zero_is_data_error() {
        let graph = build_graph(&config(vec![
            processor("one", None, Operation::Constant { value: 1.0 }),
            processor("zero", None, Operation::Constant { value: 0.0 }),
            processor(
                "ratio",
                None,
                Operation::Arithmetic {
                    lhs: String::from("one"),
                    rhs: String::from("zero"),
                    op: ArithmeticOp::Divide,
                },
            ),
        ]))
        .unwrap();
        assert!(graph.result("ratio", &event(1, None)).unwrap().is_unavailable());
        assert_eq!(graph.data_errors()[0].0, "ratio");
    }

    #[test]
    fn test_histogram_accumulates_once_per_event() {
        let graph = build_graph(&config(vec![
            processor(
                "energy",
                None,
                Operation::BeamlineValue {
                    key: String::from("energy"),
                },
            ),
            processor(
                "hist",
                None,
                Operation::Histogram {
                    input: String::from("energy"),
                    bins: 4,
                    min: 0.0,
                    max: 4.0,
                },
            ),
        ]))
        .unwrap();
        for (id, energy) in [(1, 0.5), (2, 1.5), (3, 1.7), (4, 9.0)] {
            let ev = event(id, Some(energy));
            graph.result("hist", &ev).unwrap();
            graph.result("hist", &ev).unwrap();
        }
        let hist = graph.cached("hist", EventId(4)).unwrap();
        assert_eq!(hist.value(), Value::Vector(vec![1.0, 2.0, 0.0, 0.0]));
    }

    #[test]
    fn test_bad_parameters_rejected() {
        let empty = build_processor(&processor(
            "hist",
            None,
            Operation::Histogram {
                input: String::from("x"),
                bins: 0,
                min: 0.0,
                max: 1.0,
            },
        ));
        assert!(matches!(empty, Err(GraphError::BadProcessorConfig { .. })));

        let backwards = build_processor(&processor(
            "integral",
            None,
            Operation::WaveformIntegral {
                channel: 0,
                first_sample: 10,
                last_sample: Some(2),
            },
        ));
        assert!(matches!(
            backwards,
            Err(GraphError::BadProcessorConfig { .. })
        ));
    }
}
