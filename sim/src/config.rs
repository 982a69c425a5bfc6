// Simulation configuration
//
// Deserialized from JSON with the documented defaults; validated before
// a run starts. Running with n < 3f+1 is allowed but warned about.

use std::collections::HashSet;

use consensus::HighQcPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("replicas must be at least 1")]
    NoReplicas,

    #[error("drop_rate must lie in [0, 1], got {0}")]
    DropRateOutOfRange(f64),

    #[error("{field} must be finite and non-negative, got {value}")]
    BadNumber { field: &'static str, value: f64 },

    #[error("min_delay {min} exceeds max_delay {max}")]
    BadDelayRange { min: f64, max: f64 },

    #[error("duration must be positive, got {0}")]
    BadDuration(f64),
}

/// One learner instance: a name and its two quorum thresholds. A
/// threshold above the replica count disables that rule; an omitted
/// `q_commit` resolves to the classical quorum `2f + 1`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerSpec {
    pub name: String,
    #[serde(default = "default_q_fast")]
    pub q_fast: usize,
    #[serde(default)]
    pub q_commit: Option<usize>,
}

fn default_q_fast() -> usize {
    999_999
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Replica count n
    pub replicas: usize,
    /// Fault bound; the classical quorum is 2f + 1
    pub f: usize,
    /// Indices of Byzantine equivocators
    pub byzantine: HashSet<usize>,
    /// Indices marked alive-but-corrupt (reserved classification)
    pub abc: HashSet<usize>,
    /// Override quorum size for QC formation; None means 2f + 1
    pub qc_threshold: Option<usize>,
    /// Per-delivery drop probability
    pub drop_rate: f64,
    /// Uniform delivery delay range, seconds
    pub min_delay: f64,
    pub max_delay: f64,
    /// Leader propose cadence, seconds
    pub propose_interval: f64,
    /// Simulation wall-clock length, seconds
    pub duration: f64,
    /// Learner instances; None resolves to the default fast/safe pair
    pub learners: Option<Vec<LearnerSpec>>,
    /// QC adoption policy at replicas
    pub high_qc_policy: HighQcPolicy,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            replicas: 7,
            f: 2,
            byzantine: HashSet::new(),
            abc: HashSet::new(),
            qc_threshold: None,
            drop_rate: 0.0,
            min_delay: 0.01,
            max_delay: 0.05,
            propose_interval: 0.15,
            duration: 10.0,
            learners: None,
            high_qc_policy: HighQcPolicy::default(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replicas == 0 {
            return Err(ConfigError::NoReplicas);
        }
        if !self.drop_rate.is_finite() || !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(ConfigError::DropRateOutOfRange(self.drop_rate));
        }
        for (field, value) in [
            ("min_delay", self.min_delay),
            ("max_delay", self.max_delay),
            ("propose_interval", self.propose_interval),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::BadNumber { field, value });
            }
        }
        if self.min_delay > self.max_delay {
            return Err(ConfigError::BadDelayRange {
                min: self.min_delay,
                max: self.max_delay,
            });
        }
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(ConfigError::BadDuration(self.duration));
        }
        Ok(())
    }

    /// Classical quorum for the configured fault bound
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// The same configuration with learner defaults filled in, as echoed
    /// back on `STATUS running`
    pub fn resolved(&self) -> Self {
        let mut resolved = self.clone();
        let specs = match resolved.learners.take() {
            Some(specs) => specs,
            None => vec![
                LearnerSpec {
                    name: "fast".to_string(),
                    q_fast: 4,
                    q_commit: Some(6),
                },
                LearnerSpec {
                    name: "safe".to_string(),
                    q_fast: 999,
                    q_commit: Some(self.quorum()),
                },
            ],
        };
        resolved.learners = Some(
            specs
                .into_iter()
                .map(|spec| LearnerSpec {
                    q_commit: Some(spec.q_commit.unwrap_or(self.quorum())),
                    ..spec
                })
                .collect(),
        );
        resolved
    }
}
