use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use super::ring::Backpressure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// The built-in processor kinds and their parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Constant {
        value: f64,
    },
    BeamlineValue {
        key: String,
    },
    WaveformIntegral {
        channel: usize,
        #[serde(default)]
        first_sample: usize,
        #[serde(default)]
        last_sample: Option<usize>,
    },
    FrameSum {
        detector: usize,
    },
    Compare {
        input: String,
        op: CompareOp,
        threshold: f64,
    },
    Arithmetic {
        lhs: String,
        rhs: String,
        op: ArithmeticOp,
    },
    Histogram {
        input: String,
        bins: usize,
        min: f64,
        max: f64,
    },
}

/// One entry of the processor list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub name: String,
    #[serde(default)]
    pub condition: Option<String>,
    pub operation: Operation,
}

/// Structure representing the pipeline configuration.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub ring_capacity: usize,
    pub backpressure: Backpressure,
    pub n_workers: usize,
    pub acquire_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    #[serde(default)]
    pub cache_depth: Option<usize>,
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
}

impl Default for Config {
    /// A small, runnable configuration working on the synthetic source's data
    fn default() -> Self {
        Self {
            ring_capacity: 8,
            backpressure: Backpressure::Block,
            n_workers: 2,
            acquire_timeout_ms: 100,
            drain_timeout_ms: 5000,
            cache_depth: None,
            processors: vec![
                ProcessorConfig {
                    name: String::from("pulse_energy"),
                    condition: None,
                    operation: Operation::BeamlineValue {
                        key: String::from("pulse_energy"),
                    },
                },
                ProcessorConfig {
                    name: String::from("has_beam"),
                    condition: None,
                    operation: Operation::Compare {
                        input: String::from("pulse_energy"),
                        op: CompareOp::Greater,
                        threshold: 1.2,
                    },
                },
                ProcessorConfig {
                    name: String::from("tof_integral"),
                    condition: Some(String::from("has_beam")),
                    operation: Operation::WaveformIntegral {
                        channel: 0,
                        first_sample: 0,
                        last_sample: None,
                    },
                },
                ProcessorConfig {
                    name: String::from("tof_per_energy"),
                    condition: Some(String::from("has_beam")),
                    operation: Operation::Arithmetic {
                        lhs: String::from("tof_integral"),
                        rhs: String::from("pulse_energy"),
                        op: ArithmeticOp::Divide,
                    },
                },
                ProcessorConfig {
                    name: String::from("tof_histogram"),
                    condition: Some(String::from("has_beam")),
                    operation: Operation::Histogram {
                        input: String::from("tof_per_energy"),
                        bins: 50,
                        min: 0.0,
                        max: 500.0,
                    },
                },
                ProcessorConfig {
                    name: String::from("frame_intensity"),
                    condition: None,
                    operation: Operation::FrameSum { detector: 0 },
                },
            ],
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;
        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        std::fs::write(config_path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity < 1 {
            return Err(ConfigError::InvalidValue(String::from(
                "ring_capacity must be at least 1",
            )));
        }
        if !self.is_n_workers_valid() {
            return Err(ConfigError::InvalidValue(String::from(
                "n_workers must be at least 1",
            )));
        }
        if self.acquire_timeout_ms == 0 || self.drain_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(String::from(
                "timeouts must be greater than 0 ms",
            )));
        }
        if self.cache_depth == Some(0) {
            return Err(ConfigError::InvalidValue(String::from(
                "cache_depth must be at least 1",
            )));
        }
        Ok(())
    }

    pub fn is_n_workers_valid(&self) -> bool {
        self.n_workers >= 1
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// How many recent event ids each processor keeps results for
    pub fn effective_cache_depth(&self) -> usize {
        self.cache_depth.unwrap_or(self.ring_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_round_trips_through_yaml() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.effective_cache_depth(), config.ring_capacity);
    }

    #[test]
    fn test_read_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
ring_capacity: 4
backpressure: overwrite
n_workers: 3
acquire_timeout_ms: 50
drain_timeout_ms: 1000
cache_depth: 6
processors:
  - name: energy
    operation:
      type: beamline_value
      key: pulse_energy
  - name: bright
    condition: energy
    operation:
      type: compare
      input: energy
      op: greater_equal
      threshold: 0.5
"#
        )
        .unwrap();
        let config = Config::read_config_file(file.path()).unwrap();
        assert_eq!(config.ring_capacity, 4);
        assert_eq!(config.backpressure, Backpressure::Overwrite);
        assert_eq!(config.n_workers, 3);
        assert_eq!(config.effective_cache_depth(), 6);
        assert_eq!(config.processors.len(), 2);
        assert_eq!(config.processors[1].condition.as_deref(), Some("energy"));
        assert_eq!(
            config.processors[1].operation,
            Operation::Compare {
                input: String::from("energy"),
                op: CompareOp::GreaterEqual,
                threshold: 0.5
            }
        );
    }

    #[test]
    fn test_missing_file() {
        let result = Config::read_config_file(Path::new("/definitely/not/here.yml"));
        assert!(matches!(result, Err(ConfigError::BadFilePath(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let config = Config {
            n_workers: 0,
            ..Default::default()
        };
        file.write_all(serde_yaml::to_string(&config).unwrap().as_bytes())
            .unwrap();
        assert!(matches!(
            Config::read_config_file(file.path()),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_bad_yaml_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"ring_capacity: [not, a, number]\n").unwrap();
        assert!(matches!(
            Config::read_config_file(file.path()),
            Err(ConfigError::ParsingError(_))
        ));
    }
}
