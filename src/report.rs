//! Threshold partition and the published artifacts.
//!
//! Everything threshold-dependent is derived from the ranked scored set by
//! [`ModelDiagnostics::apply_threshold`], so a later `rethreshold` over
//! `scored_providers.csv` reproduces a direct run byte for byte.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::Writer;
use serde::{Deserialize, Serialize};

use crate::common::{tmp_path_for, write_atomic};
use crate::constants::{
    FLAGGED_PROVIDERS_FILE, MODEL_DIAGNOSTICS_FILE, MODEL_FILE, SCORED_PROVIDERS_CSV,
    SCORED_PROVIDERS_PARQUET,
};
use crate::error::ArtifactError;
use crate::features::FeatureId;
use crate::labels::LabelReport;
use crate::model::{CrossValidation, FeatureWeight, TrainedModel};
use crate::parquet_writer::{Cell, ColumnType, TypedParquetWriter};
use crate::peers::PeerFallback;
use crate::records::IngestTally;
use crate::scoring::{RiskFactor, RiskScoreRecord};

/// Providers at or above `threshold`, in rank order.
/// Sorted by weight, descending. Equal weights keep their schema order.
pub fn by_weight(importance: &[FeatureWeight]) -> Vec<FeatureWeight> {
    let mut sorted = importance.to_vec();
    sorted.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then_with(|| a.feature.index().cmp(&b.feature.index()))
    });
    sorted
}

pub fn partition_flagged(records: &[RiskScoreRecord], threshold: f64) -> Vec<&RiskScoreRecord> {
    records
        .iter()
        .filter(|r| r.fraud_probability >= threshold)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedReport {
    pub model_version: String,
    pub schema_version: String,
    pub threshold: f64,
    pub flagged_count: usize,
    pub providers: Vec<RiskScoreRecord>,
}

impl FlaggedReport {
    pub fn new(diagnostics: &ModelDiagnostics, records: &[RiskScoreRecord]) -> Self {
        let providers: Vec<RiskScoreRecord> = partition_flagged(records, diagnostics.threshold)
            .into_iter()
            .cloned()
            .collect();
        Self {
            model_version: diagnostics.model_version.clone(),
            schema_version: diagnostics.schema_version.clone(),
            threshold: diagnostics.threshold,
            flagged_count: providers.len(),
            providers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDiagnostics {
    pub model_version: String,
    pub schema_version: String,
    pub classifier: String,
    pub seed: u64,
    pub labeled_examples: usize,
    pub positives: usize,
    pub cross_validation: CrossValidation,
    /// Heaviest first; `model.json` keeps schema order.
    pub feature_importance: Vec<FeatureWeight>,
    pub leakage_risk_features: Vec<FeatureId>,
    pub providers_scored: usize,
    pub threshold: f64,
    pub flagged_count: usize,
    pub total_payments_flagged: f64,
    pub flagged_by_specialty: BTreeMap<String, usize>,
    pub flagged_by_state: BTreeMap<String, usize>,
    pub ingest: IngestTally,
    pub labels: LabelReport,
    pub peer_fallbacks: Vec<PeerFallback>,
}

/// Run-level facts recorded alongside the model.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub ingest: IngestTally,
    pub labels: LabelReport,
    pub peer_fallbacks: Vec<PeerFallback>,
    pub leakage_risk_features: Vec<FeatureId>,
}

impl ModelDiagnostics {
    pub fn new<M>(
        model: &TrainedModel<M>,
        records: &[RiskScoreRecord],
        threshold: f64,
        context: RunContext,
    ) -> Self {
        let mut diagnostics = Self {
            model_version: model.model_version.clone(),
            schema_version: model.schema_version.clone(),
            classifier: model.classifier.clone(),
            seed: model.seed,
            labeled_examples: model.training_examples,
            positives: model.positives,
            cross_validation: model.cross_validation.clone(),
            feature_importance: by_weight(&model.feature_importance),
            leakage_risk_features: context.leakage_risk_features,
            providers_scored: records.len(),
            threshold,
            flagged_count: 0,
            total_payments_flagged: 0.0,
            flagged_by_specialty: BTreeMap::new(),
            flagged_by_state: BTreeMap::new(),
            ingest: context.ingest,
            labels: context.labels,
            peer_fallbacks: context.peer_fallbacks,
        };
        diagnostics.apply_threshold(records, threshold);
        diagnostics
    }

    /// Recomputes every threshold-dependent field from the ranked records.
    pub fn apply_threshold(&mut self, records: &[RiskScoreRecord], threshold: f64) {
        let flagged = partition_flagged(records, threshold);
        self.threshold = threshold;
        self.flagged_count = flagged.len();
        self.total_payments_flagged = flagged.iter().map(|r| r.total_payments).sum();
        self.flagged_by_specialty.clear();
        self.flagged_by_state.clear();
        for record in flagged {
            *self
                .flagged_by_specialty
                .entry(record.specialty.clone())
                .or_default() += 1;
            *self.flagged_by_state.entry(record.state.clone()).or_default() += 1;
        }
    }
}

/// One line of `scored_providers.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ScoredRow {
    position: u64,
    rank: u64,
    provider_id: String,
    fraud_probability: f64,
    specialty: String,
    state: String,
    entity_type: Option<String>,
    total_payments: f64,
    total_services: u64,
    total_beneficiaries: u64,
    markup_ratio: f64,
    services_per_beneficiary: f64,
    risk_factors: String,
}

/// `feature=contribution;...`, with contributions in shortest round-trip form.
pub fn encode_risk_factors(factors: &[RiskFactor]) -> String {
    factors
        .iter()
        .map(|f| format!("{}={}", f.feature.name(), f.contribution))
        .collect::<Vec<_>>()
        .join(";")
}

pub fn decode_risk_factors(raw: &str) -> Result<Vec<RiskFactor>, String> {
    raw.split(';')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| format!("risk factor `{part}` is not `feature=contribution`"))?;
            let feature =
                FeatureId::from_name(name).ok_or_else(|| format!("unknown feature `{name}`"))?;
            let contribution: f64 = value
                .trim()
                .parse()
                .map_err(|_| format!("contribution `{value}` is not a number"))?;
            Ok(RiskFactor::new(feature, contribution))
        })
        .collect()
}

impl From<&RiskScoreRecord> for ScoredRow {
    fn from(record: &RiskScoreRecord) -> Self {
        Self {
            position: record.position,
            rank: record.rank,
            provider_id: record.provider_id.clone(),
            fraud_probability: record.fraud_probability,
            specialty: record.specialty.clone(),
            state: record.state.clone(),
            entity_type: record.entity_type.clone(),
            total_payments: record.total_payments,
            total_services: record.total_services,
            total_beneficiaries: record.total_beneficiaries,
            markup_ratio: record.markup_ratio,
            services_per_beneficiary: record.services_per_beneficiary,
            risk_factors: encode_risk_factors(&record.top_risk_factors),
        }
    }
}

impl ScoredRow {
    fn into_record(self) -> Result<RiskScoreRecord, String> {
        Ok(RiskScoreRecord {
            top_risk_factors: decode_risk_factors(&self.risk_factors)?,
            provider_id: self.provider_id,
            fraud_probability: self.fraud_probability,
            rank: self.rank,
            position: self.position,
            specialty: self.specialty,
            state: self.state,
            entity_type: self.entity_type.filter(|e| !e.is_empty()),
            total_payments: self.total_payments,
            total_services: self.total_services,
            total_beneficiaries: self.total_beneficiaries,
            markup_ratio: self.markup_ratio,
            services_per_beneficiary: self.services_per_beneficiary,
        })
    }
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("Failed serializing {}", path.display()))?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

fn write_scored_csv(path: &Path, records: &[RiskScoreRecord]) -> Result<()> {
    let tmp_path = tmp_path_for(path);
    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating scored providers CSV {}", tmp_path.display()))?;
    for record in records {
        writer
            .serialize(ScoredRow::from(record))
            .with_context(|| format!("Failed writing scored row for {}", record.provider_id))?;
    }
    writer
        .flush()
        .context("Failed flushing scored providers writer")?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed moving scored providers {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

const SCORED_COLUMNS: [(&str, ColumnType); 13] = [
    ("position", ColumnType::Int64),
    ("rank", ColumnType::Int64),
    ("provider_id", ColumnType::Utf8),
    ("fraud_probability", ColumnType::Float64),
    ("specialty", ColumnType::Utf8),
    ("state", ColumnType::Utf8),
    ("entity_type", ColumnType::Utf8),
    ("total_payments", ColumnType::Float64),
    ("total_services", ColumnType::Int64),
    ("total_beneficiaries", ColumnType::Int64),
    ("markup_ratio", ColumnType::Float64),
    ("services_per_beneficiary", ColumnType::Float64),
    ("risk_factors", ColumnType::Utf8),
];

fn as_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn write_scored_parquet(path: &Path, records: &[RiskScoreRecord]) -> Result<()> {
    let mut writer = TypedParquetWriter::try_new(path, &SCORED_COLUMNS, 8_192)?;
    for record in records {
        let factors = encode_risk_factors(&record.top_risk_factors);
        let row = [
            Cell::I64(as_i64(record.position)),
            Cell::I64(as_i64(record.rank)),
            Cell::Str(Some(&record.provider_id)),
            Cell::F64(record.fraud_probability),
            Cell::Str(Some(&record.specialty)),
            Cell::Str(Some(&record.state)),
            Cell::Str(record.entity_type.as_deref()),
            Cell::F64(record.total_payments),
            Cell::I64(as_i64(record.total_services)),
            Cell::I64(as_i64(record.total_beneficiaries)),
            Cell::F64(record.markup_ratio),
            Cell::F64(record.services_per_beneficiary),
            Cell::Str(Some(&factors)),
        ];
        if let Err(err) = writer.push_row(&row) {
            writer.abort();
            return Err(err);
        }
    }
    writer.finish()
}

fn artifact_result(path: &Path, result: Result<()>) -> Result<PathBuf, ArtifactError> {
    result
        .map(|()| path.to_path_buf())
        .map_err(|err| ArtifactError::Write {
            path: path.display().to_string(),
            message: format!("{err:#}"),
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub flagged: PathBuf,
    pub diagnostics: PathBuf,
    pub scored_csv: Option<PathBuf>,
    pub scored_parquet: Option<PathBuf>,
    pub model: Option<PathBuf>,
}

/// The two threshold-dependent artifacts.
pub fn write_threshold_artifacts(
    output_dir: &Path,
    records: &[RiskScoreRecord],
    diagnostics: &ModelDiagnostics,
) -> Result<ArtifactPaths, ArtifactError> {
    let flagged_path = output_dir.join(FLAGGED_PROVIDERS_FILE);
    let flagged = artifact_result(
        &flagged_path,
        write_json(&flagged_path, &FlaggedReport::new(diagnostics, records)),
    )?;
    let diagnostics_path = output_dir.join(MODEL_DIAGNOSTICS_FILE);
    let diagnostics =
        artifact_result(&diagnostics_path, write_json(&diagnostics_path, diagnostics))?;
    Ok(ArtifactPaths {
        flagged,
        diagnostics,
        scored_csv: None,
        scored_parquet: None,
        model: None,
    })
}

pub fn write_run_artifacts<M: Serialize>(
    output_dir: &Path,
    model: &TrainedModel<M>,
    records: &[RiskScoreRecord],
    diagnostics: &ModelDiagnostics,
) -> Result<ArtifactPaths, ArtifactError> {
    let mut paths = write_threshold_artifacts(output_dir, records, diagnostics)?;

    let csv_path = output_dir.join(SCORED_PROVIDERS_CSV);
    paths.scored_csv = Some(artifact_result(&csv_path, write_scored_csv(&csv_path, records))?);
    let parquet_path = output_dir.join(SCORED_PROVIDERS_PARQUET);
    paths.scored_parquet = Some(artifact_result(
        &parquet_path,
        write_scored_parquet(&parquet_path, records),
    )?);
    let model_path = output_dir.join(MODEL_FILE);
    paths.model = Some(artifact_result(&model_path, write_json(&model_path, model))?);

    tracing::info!(
        output_dir = %output_dir.display(),
        scored = records.len(),
        flagged = diagnostics.flagged_count,
        "wrote artifacts"
    );
    Ok(paths)
}

/// Reads a scored set back in position order.
pub fn read_scored_csv(path: &Path) -> Result<Vec<RiskScoreRecord>, ArtifactError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|err| ArtifactError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
    let mut records = Vec::new();
    for (idx, row) in reader.deserialize::<ScoredRow>().enumerate() {
        let row_number = idx as u64 + 1;
        let malformed = |message: String| ArtifactError::MalformedScoredRow {
            path: path.display().to_string(),
            row: row_number,
            message,
        };
        let record = row
            .map_err(|err| malformed(err.to_string()))?
            .into_record()
            .map_err(malformed)?;
        if record.position != row_number {
            return Err(malformed(format!(
                "position {} out of sequence; expected {row_number}",
                record.position
            )));
        }
        records.push(record);
    }
    Ok(records)
}

pub fn read_diagnostics(path: &Path) -> Result<ModelDiagnostics, ArtifactError> {
    let read_error = |message: String| ArtifactError::Read {
        path: path.display().to_string(),
        message,
    };
    let raw = fs::read_to_string(path).map_err(|err| read_error(err.to_string()))?;
    serde_json::from_str(&raw).map_err(|err| read_error(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        id: &str,
        probability: f64,
        position: u64,
        specialty: &str,
        state: &str,
    ) -> RiskScoreRecord {
        RiskScoreRecord {
            provider_id: id.to_string(),
            fraud_probability: probability,
            rank: position,
            position,
            specialty: specialty.to_string(),
            state: state.to_string(),
            entity_type: (position % 2 == 0).then(|| "organization".to_string()),
            total_payments: 1_000.25 * position as f64,
            total_services: 10 * position,
            total_beneficiaries: position,
            markup_ratio: 1.0 / 3.0,
            services_per_beneficiary: 10.0,
            top_risk_factors: vec![
                RiskFactor::new(FeatureId::ZPayment, 0.1 + 0.2),
                RiskFactor::new(FeatureId::CovidTestShare, 1e-17),
            ],
        }
    }

    fn records() -> Vec<RiskScoreRecord> {
        vec![
            record("1000000001", 0.95, 1, "Cardiology", "OH"),
            record("1000000002", 0.7, 2, "Cardiology", "TX"),
            record("1000000003", 0.7, 3, "Dermatology", "OH"),
            record("1000000004", 0.2, 4, "Dermatology", "OH"),
        ]
    }

    fn diagnostics(threshold: f64) -> ModelDiagnostics {
        ModelDiagnostics {
            model_version: "fv-2-0000000000000001".to_string(),
            schema_version: "fv-2".to_string(),
            classifier: "random_forest".to_string(),
            seed: 1,
            labeled_examples: 4,
            positives: 1,
            cross_validation: CrossValidation {
                folds: 2,
                fold_auc: vec![0.8, 0.9],
                mean_auc: 0.85,
                std_auc: 0.05,
                fold_sizes: Vec::new(),
            },
            feature_importance: Vec::new(),
            leakage_risk_features: vec![FeatureId::YearsActive],
            providers_scored: 4,
            threshold: 0.0,
            flagged_count: 0,
            total_payments_flagged: 0.0,
            flagged_by_specialty: BTreeMap::new(),
            flagged_by_state: BTreeMap::new(),
            ingest: IngestTally::default(),
            labels: LabelReport::default(),
            peer_fallbacks: Vec::new(),
        }
        .tap_threshold(threshold)
    }

    impl ModelDiagnostics {
        fn tap_threshold(mut self, threshold: f64) -> Self {
            self.apply_threshold(&records(), threshold);
            self
        }
    }

    #[test]
    fn diagnostics_list_importance_heaviest_first() {
        let weights = [
            (FeatureId::ZPayment, 0.1),
            (FeatureId::ZServices, 0.4),
            (FeatureId::MarkupRatio, 0.1),
            (FeatureId::YearsActive, 0.25),
            (FeatureId::CodeConcentration, 0.15),
        ];
        let model = TrainedModel {
            model_version: "fv-2-0000000000000001".to_string(),
            schema_version: "fv-2".to_string(),
            classifier: "random_forest".to_string(),
            seed: 1,
            features: weights.iter().map(|(f, _)| *f).collect(),
            training_examples: 4,
            positives: 1,
            cross_validation: diagnostics(0.5).cross_validation,
            feature_importance: weights
                .iter()
                .map(|(feature, weight)| FeatureWeight {
                    feature: *feature,
                    weight: *weight,
                })
                .collect(),
            model: (),
        };

        let d = ModelDiagnostics::new(&model, &records(), 0.5, RunContext::default());
        let order: Vec<FeatureId> = d.feature_importance.iter().map(|w| w.feature).collect();
        assert_eq!(
            order,
            vec![
                FeatureId::ZServices,
                FeatureId::YearsActive,
                FeatureId::CodeConcentration,
                FeatureId::MarkupRatio,
                FeatureId::ZPayment,
            ]
        );
        for pair in d.feature_importance.windows(2) {
            assert!(pair[0].weight >= pair[1].weight);
        }
        let total: f64 = d.feature_importance.iter().map(|w| w.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
        // the model keeps schema order
        assert_eq!(model.feature_importance[0].feature, FeatureId::ZPayment);
    }

    #[test]
    fn threshold_is_inclusive() {
        let r = records();
        assert_eq!(partition_flagged(&r, 0.7).len(), 3);
        assert_eq!(partition_flagged(&r, 0.70001).len(), 1);
        assert_eq!(partition_flagged(&r, 0.0).len(), 4);
        assert!(partition_flagged(&r, 1.0).is_empty());
    }

    #[test]
    fn threshold_fields_follow_partition() {
        let d = diagnostics(0.5);
        assert_eq!(d.flagged_count, 3);
        assert_eq!(d.flagged_by_specialty["Cardiology"], 2);
        assert_eq!(d.flagged_by_specialty["Dermatology"], 1);
        assert_eq!(d.flagged_by_state["OH"], 2);
        assert_eq!(d.flagged_by_state["TX"], 1);
        assert!((d.total_payments_flagged - 6_001.5).abs() < 1e-9);

        let mut lowered = d.clone();
        lowered.apply_threshold(&records(), 0.1);
        assert_eq!(lowered.flagged_count, 4);
        lowered.apply_threshold(&records(), 0.5);
        assert_eq!(lowered, d);
    }

    #[test]
    fn risk_factor_encoding_is_exact() {
        let factors = vec![
            RiskFactor::new(FeatureId::ZPayment, 0.1 + 0.2),
            RiskFactor::new(FeatureId::MarkupUndefined, 1e-17),
        ];
        let encoded = encode_risk_factors(&factors);
        assert_eq!(decode_risk_factors(&encoded).unwrap(), factors);
        assert!(decode_risk_factors("").unwrap().is_empty());
        assert!(decode_risk_factors("bogus=1").is_err());
        assert!(decode_risk_factors("z_payment").is_err());
    }

    #[test]
    fn scored_csv_reads_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCORED_PROVIDERS_CSV);
        write_scored_csv(&path, &records()).unwrap();
        assert_eq!(read_scored_csv(&path).unwrap(), records());
    }

    #[test]
    fn out_of_sequence_positions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCORED_PROVIDERS_CSV);
        let mut shuffled = records();
        shuffled.swap(0, 2);
        write_scored_csv(&path, &shuffled).unwrap();
        let err = read_scored_csv(&path).unwrap_err();
        assert!(matches!(err, ArtifactError::MalformedScoredRow { row: 1, .. }), "{err}");
    }

    #[test]
    fn threshold_artifacts_round_trip_through_rethreshold_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let d = diagnostics(0.5);
        let paths = write_threshold_artifacts(dir.path(), &records(), &d).unwrap();
        assert_eq!(read_diagnostics(&paths.diagnostics).unwrap(), d);

        let flagged: FlaggedReport =
            serde_json::from_str(&fs::read_to_string(&paths.flagged).unwrap()).unwrap();
        assert_eq!(flagged.flagged_count, 3);
        assert_eq!(flagged.providers[0].provider_id, "1000000001");
    }
}
