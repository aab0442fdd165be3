//! Model registry and request parameter validation.
//!
//! Each executable model is described by a configuration record: the version
//! it runs, the outputs it can generate, and the bounds accepted for scalar
//! and distribution parameters. Submissions are validated against the record
//! for the requested model, and every failure is collected so clients get the
//! full list rather than the first problem found.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Distribution families a model parameter may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionType {
    Normal,
    Lognormal,
}

impl std::fmt::Display for DistributionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistributionType::Normal => write!(f, "normal"),
            DistributionType::Lognormal => write!(f, "lognormal"),
        }
    }
}

/// A distribution parameter definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub min: i64,
    pub max: i64,
    #[serde(rename = "type")]
    pub kind: DistributionType,
}

/// A single model parameter: either a scalar value or a distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parameter {
    Scalar { scalar: f64 },
    Distribution { distribution: Distribution },
}

/// Configuration record for one executable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub version: f64,
    pub outputs: Vec<String>,
    pub min_scalar: f64,
    pub max_scalar: f64,
    pub min_distribution: i64,
    pub max_distribution: i64,
    pub distribution_types: Vec<DistributionType>,
}

/// Registry of the models this deployment can execute, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelConfig>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the models this platform ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ModelConfig {
            name: "NWM".to_string(),
            version: 2.0,
            outputs: vec!["streamflow".to_string()],
            min_scalar: 0.0,
            max_scalar: 10.0,
            min_distribution: 0,
            max_distribution: 10,
            distribution_types: vec![DistributionType::Normal, DistributionType::Lognormal],
        });
        registry
    }

    pub fn register(&mut self, config: ModelConfig) {
        self.models.insert(config.name.clone(), config);
    }

    pub fn get(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    pub fn model_names(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    /// Validate a submission against the named model's configuration.
    ///
    /// Returns every failure message rather than stopping at the first, so
    /// the caller can report the complete list.
    pub fn validate(
        &self,
        model_name: &str,
        output: &str,
        parameters: &HashMap<String, Parameter>,
    ) -> Result<(), Vec<String>> {
        let mut failures = Vec::new();

        let config = match self.get(model_name) {
            Some(config) => config,
            None => {
                return Err(vec![format!(
                    "{} is not a recognized model; known models are: {}",
                    model_name,
                    self.model_names().join(", ")
                )]);
            }
        };

        if !config.outputs.iter().any(|allowed| allowed == output) {
            failures.push(format!(
                "{} is not an allowable output for {}; acceptable outputs are: {}",
                output,
                config.name,
                config.outputs.join(", ")
            ));
        }

        for (name, parameter) in parameters {
            match parameter {
                Parameter::Scalar { scalar } => {
                    if *scalar < config.min_scalar || *scalar > config.max_scalar {
                        failures.push(format!(
                            "scalar for {} is {}, outside the accepted range [{}, {}]",
                            name, scalar, config.min_scalar, config.max_scalar
                        ));
                    }
                }
                Parameter::Distribution { distribution } => {
                    if distribution.min > distribution.max {
                        failures.push(format!(
                            "distribution for {} has min {} greater than max {}",
                            name, distribution.min, distribution.max
                        ));
                    }
                    if distribution.min < config.min_distribution {
                        failures.push(format!(
                            "distribution minimum for {} is {}, below the accepted minimum {}",
                            name, distribution.min, config.min_distribution
                        ));
                    }
                    if distribution.max > config.max_distribution {
                        failures.push(format!(
                            "distribution maximum for {} is {}, above the accepted maximum {}",
                            name, distribution.max, config.max_distribution
                        ));
                    }
                    if !config.distribution_types.contains(&distribution.kind) {
                        failures.push(format!(
                            "{} is not an accepted distribution type for {}",
                            distribution.kind, name
                        ));
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}
