//! Run configuration.
//!
//! Settings come from a TOML file and may be overridden on the command line.
//! The seed, the publication threshold and the minimum-history constants have
//! no defaults: a run that does not set them stops before reading any data.

use std::path::Path;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_FOLDS, DEFAULT_MAX_DEPTH, DEFAULT_MAX_REJECTION_RATE, DEFAULT_MIN_PEER_COUNT,
    DEFAULT_MIN_SAMPLES_LEAF, DEFAULT_STD_FLOOR, DEFAULT_TOP_RISK_FACTORS, DEFAULT_TREES,
    DEFAULT_WORKING_DAYS_PER_YEAR, LEAKAGE_RISK_FEATURES,
};
use crate::error::ConfigError;
use crate::features::FeatureId;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub run: FileRunConfig,
    #[serde(default)]
    pub ingest: FileIngestConfig,
    #[serde(default)]
    pub peers: FilePeersConfig,
    #[serde(default)]
    pub features: FileFeaturesConfig,
    #[serde(default)]
    pub labels: FileLabelsConfig,
    #[serde(default)]
    pub training: FileTrainingConfig,
    #[serde(default)]
    pub scoring: FileScoringConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileRunConfig {
    pub seed: Option<u64>,
    pub threshold: Option<f64>,
    pub parallelism: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileIngestConfig {
    pub max_rejection_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilePeersConfig {
    pub min_peer_count: Option<usize>,
    pub std_floor: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileFeaturesConfig {
    pub working_days_per_year: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileLabelsConfig {
    pub min_total_services: Option<u64>,
    pub min_years_active: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileTrainingConfig {
    pub folds: Option<usize>,
    pub trees: Option<usize>,
    pub max_depth: Option<usize>,
    pub min_samples_leaf: Option<usize>,
    #[serde(default)]
    pub exclude_features: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileScoringConfig {
    pub top_risk_factors: Option<usize>,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub seed: Option<u64>,
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub max_rejection_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub min_peer_count: usize,
    pub std_floor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    pub working_days_per_year: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelConfig {
    pub min_total_services: u64,
    pub min_years_active: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub folds: usize,
    pub trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub exclude_features: Vec<FeatureId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub top_risk_factors: usize,
}

/// Validated settings for one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub seed: u64,
    pub threshold: f64,
    pub parallelism: usize,
    pub ingest: IngestConfig,
    pub peers: PeerConfig,
    pub features: FeatureConfig,
    pub labels: LabelConfig,
    pub training: TrainingConfig,
    pub scoring: ScoringConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path, overrides: &Overrides) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_toml_str(&raw, &path.display().to_string(), overrides)
    }

    pub fn from_toml_str(
        raw: &str,
        origin: &str,
        overrides: &Overrides,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(raw).map_err(|err| ConfigError::Parse {
            path: origin.to_string(),
            message: err.to_string(),
        })?;
        Self::resolve(file, overrides)
    }

    pub fn resolve(file: FileConfig, overrides: &Overrides) -> Result<Self, ConfigError> {
        let seed = overrides
            .seed
            .or(file.run.seed)
            .ok_or(ConfigError::Missing { key: "run.seed" })?;
        let threshold = overrides
            .threshold
            .or(file.run.threshold)
            .ok_or(ConfigError::Missing { key: "run.threshold" })?;
        validate_threshold(threshold)?;

        let parallelism = file.run.parallelism.unwrap_or_else(default_parallelism);
        ensure_positive("run.parallelism", parallelism)?;

        let max_rejection_rate = file
            .ingest
            .max_rejection_rate
            .unwrap_or(DEFAULT_MAX_REJECTION_RATE);
        if !(0.0..=1.0).contains(&max_rejection_rate) {
            return Err(ConfigError::Invalid {
                key: "ingest.max_rejection_rate",
                value: max_rejection_rate.to_string(),
                expected: "a fraction in [0, 1]",
            });
        }

        let min_peer_count = file.peers.min_peer_count.unwrap_or(DEFAULT_MIN_PEER_COUNT);
        if min_peer_count < 2 {
            return Err(ConfigError::Invalid {
                key: "peers.min_peer_count",
                value: min_peer_count.to_string(),
                expected: "at least 2 providers",
            });
        }
        let std_floor = file.peers.std_floor.unwrap_or(DEFAULT_STD_FLOOR);
        if !(std_floor.is_finite() && std_floor > 0.0) {
            return Err(ConfigError::Invalid {
                key: "peers.std_floor",
                value: std_floor.to_string(),
                expected: "a positive finite number",
            });
        }

        let working_days_per_year = file
            .features
            .working_days_per_year
            .unwrap_or(DEFAULT_WORKING_DAYS_PER_YEAR);
        if !(working_days_per_year.is_finite() && (1.0..=366.0).contains(&working_days_per_year)) {
            return Err(ConfigError::Invalid {
                key: "features.working_days_per_year",
                value: working_days_per_year.to_string(),
                expected: "a day count in [1, 366]",
            });
        }

        let min_total_services = file.labels.min_total_services.ok_or(ConfigError::Missing {
            key: "labels.min_total_services",
        })?;
        let min_years_active = file.labels.min_years_active.ok_or(ConfigError::Missing {
            key: "labels.min_years_active",
        })?;

        let folds = file.training.folds.unwrap_or(DEFAULT_FOLDS);
        if folds < 2 {
            return Err(ConfigError::Invalid {
                key: "training.folds",
                value: folds.to_string(),
                expected: "at least 2 folds",
            });
        }
        let trees = file.training.trees.unwrap_or(DEFAULT_TREES);
        ensure_positive("training.trees", trees)?;
        let max_depth = file.training.max_depth.unwrap_or(DEFAULT_MAX_DEPTH);
        ensure_positive("training.max_depth", max_depth)?;
        let min_samples_leaf = file
            .training
            .min_samples_leaf
            .unwrap_or(DEFAULT_MIN_SAMPLES_LEAF);
        ensure_positive("training.min_samples_leaf", min_samples_leaf)?;

        let mut exclude_features = Vec::with_capacity(file.training.exclude_features.len());
        for name in &file.training.exclude_features {
            let id = FeatureId::from_name(name).ok_or_else(|| ConfigError::UnknownFeature {
                name: name.clone(),
            })?;
            if !exclude_features.contains(&id) {
                exclude_features.push(id);
            }
        }
        if exclude_features.len() == FeatureId::ALL.len() {
            return Err(ConfigError::Invalid {
                key: "training.exclude_features",
                value: format!("{} features", exclude_features.len()),
                expected: "at least one feature left for training",
            });
        }

        let top_risk_factors = file
            .scoring
            .top_risk_factors
            .unwrap_or(DEFAULT_TOP_RISK_FACTORS);

        Ok(Self {
            seed,
            threshold,
            parallelism,
            ingest: IngestConfig { max_rejection_rate },
            peers: PeerConfig {
                min_peer_count,
                std_floor,
            },
            features: FeatureConfig {
                working_days_per_year,
            },
            labels: LabelConfig {
                min_total_services,
                min_years_active,
            },
            training: TrainingConfig {
                folds,
                trees,
                max_depth,
                min_samples_leaf,
                exclude_features,
            },
            scoring: ScoringConfig { top_risk_factors },
        })
    }

    /// Features handed to the classifier, in schema order.
    pub fn model_features(&self) -> Vec<FeatureId> {
        FeatureId::ALL
            .iter()
            .copied()
            .filter(|id| !self.training.exclude_features.contains(id))
            .collect()
    }

    /// Model inputs that may encode the label through data availability.
    pub fn leakage_risk_features(&self) -> Vec<FeatureId> {
        self.model_features()
            .into_iter()
            .filter(|id| LEAKAGE_RISK_FEATURES.contains(&id.name()))
            .collect()
    }
}

pub fn validate_threshold(threshold: f64) -> Result<(), ConfigError> {
    if threshold.is_finite() && (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key: "run.threshold",
            value: threshold.to_string(),
            expected: "a probability in [0, 1]",
        })
    }
}

fn ensure_positive(key: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            expected: "a positive integer",
        });
    }
    Ok(())
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
