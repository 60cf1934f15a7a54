use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage a fatal error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Ingest,
    Labels,
    Training,
    Artifacts,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::Ingest => "ingest",
            Stage::Labels => "label_resolver",
            Stage::Training => "classifier_trainer",
            Stage::Artifacts => "artifact_writer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingProviderId,
    MissingProcedureCode,
    InvalidYear,
    NonNumericCount,
    NegativeCount,
    CountOutOfRange,
    NonNumericAmount,
    NegativeAmount,
    AmountOutOfRange,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::MissingProviderId => "missing provider id",
            RejectReason::MissingProcedureCode => "missing procedure code",
            RejectReason::InvalidYear => "year outside 1990..=2100",
            RejectReason::NonNumericCount => "non-numeric count",
            RejectReason::NegativeCount => "negative count",
            RejectReason::CountOutOfRange => "count above the accepted maximum",
            RejectReason::NonNumericAmount => "non-numeric monetary amount",
            RejectReason::NegativeAmount => "negative monetary amount",
            RejectReason::AmountOutOfRange => "monetary amount above the accepted maximum",
        };
        f.write_str(text)
    }
}

/// A billing row that failed validation. Rows carrying one are dropped and tallied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} in field `{field}` (value {value:?})")]
pub struct MalformedRecordError {
    pub field: &'static str,
    pub value: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error(
        "rejected {rejected} of {total} billing rows (rate {rate:.4}) which exceeds the configured ceiling {ceiling:.4}; first rejection at row {first_row}: {first_error}"
    )]
    RejectionCeiling {
        rejected: u64,
        total: u64,
        rate: f64,
        ceiling: f64,
        first_row: u64,
        first_error: MalformedRecordError,
    },
    #[error("billing source {path} is missing required column `{column}`")]
    MissingColumn { path: String, column: &'static str },
    #[error("unsupported input extension for {path}; use .csv or .parquet")]
    UnsupportedExtension { path: String },
    #[error("failed reading {path}: {message}")]
    Source { path: String, message: String },
    #[error("billing extract contained no valid rows ({total} rows read)")]
    NoValidRows { total: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudSource {
    ExclusionRegistry,
    Prosecution,
}

impl fmt::Display for FraudSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FraudSource::ExclusionRegistry => f.write_str("exclusion registry"),
            FraudSource::Prosecution => f.write_str("prosecution list"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelConflictError {
    #[error(
        "identifier {identifier} appears twice in the {list} (rows {first_row} and {second_row}); each identifier must map to one entry"
    )]
    Duplicate {
        list: FraudSource,
        identifier: String,
        first_row: u64,
        second_row: u64,
    },
    #[error(
        "identifier {identifier} has conflicting {list} entries ({first} vs {second}); ground truth must be unambiguous"
    )]
    Conflict {
        list: FraudSource,
        identifier: String,
        first: String,
        second: String,
    },
    #[error(
        "billing providers {first} and {second} both resolve to identifier {identifier}; labels cannot be assigned unambiguously"
    )]
    AmbiguousProvider {
        identifier: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainingError {
    #[error(
        "cannot stratify {folds} folds: {positives} positive and {negatives} negative labeled providers (need at least {folds} of each)"
    )]
    InsufficientClassCounts {
        folds: usize,
        positives: usize,
        negatives: usize,
    },
    #[error("feature matrix row {row} has {found} columns, expected {expected}")]
    RaggedFeatures {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("fold {fold} produced a degenerate validation split ({positives} positives, {negatives} negatives)")]
    DegenerateFold {
        fold: usize,
        positives: usize,
        negatives: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("required setting `{key}` is missing")]
    Missing { key: &'static str },
    #[error("setting `{key}` = {value} is invalid: {expected}")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("setting `training.exclude_features` names unknown feature `{name}`")]
    UnknownFeature { name: String },
    #[error("failed parsing config {path}: {message}")]
    Parse { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArtifactError {
    #[error("failed writing {path}: {message}")]
    Write { path: String, message: String },
    #[error("failed reading {path}: {message}")]
    Read { path: String, message: String },
    #[error("{path} row {row}: {message}")]
    MalformedScoredRow {
        path: String,
        row: u64,
        message: String,
    },
}

/// A fatal pipeline error tagged with the stage that raised it.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("[stage={stage}] {0}", stage = Stage::Config)]
    Config(#[from] ConfigError),
    #[error("[stage={stage}] {0}", stage = Stage::Ingest)]
    Ingest(#[from] IngestError),
    #[error("[stage={stage}] {0}", stage = Stage::Labels)]
    Labels(#[from] LabelConflictError),
    #[error("[stage={stage}] {0}", stage = Stage::Training)]
    Training(#[from] TrainingError),
    #[error("[stage={stage}] {0}", stage = Stage::Artifacts)]
    Artifacts(#[from] ArtifactError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Config(_) => Stage::Config,
            PipelineError::Ingest(_) => Stage::Ingest,
            PipelineError::Labels(_) => Stage::Labels,
            PipelineError::Training(_) => Stage::Training,
            PipelineError::Artifacts(_) => Stage::Artifacts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_names_stage_and_invariant() {
        let err = PipelineError::from(TrainingError::InsufficientClassCounts {
            folds: 5,
            positives: 2,
            negatives: 400,
        });
        assert_eq!(err.stage(), Stage::Training);
        let text = err.to_string();
        assert!(text.starts_with("[stage=classifier_trainer]"), "{text}");
        assert!(text.contains("2 positive"), "{text}");
    }

    #[test]
    fn label_conflict_reports_rows() {
        let err = PipelineError::from(LabelConflictError::Duplicate {
            list: FraudSource::Prosecution,
            identifier: "1234567890".to_string(),
            first_row: 3,
            second_row: 9,
        });
        let text = err.to_string();
        assert!(text.contains("[stage=label_resolver]"));
        assert!(text.contains("rows 3 and 9"));
    }
}
