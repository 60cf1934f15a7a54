//! Stage orchestration for `run` and `rethreshold`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::aggregate::{ProviderAggregate, aggregate_records};
use crate::config::{PipelineConfig, validate_threshold};
use crate::error::{ArtifactError, PipelineError};
use crate::features::{FeatureVector, build_feature_vectors};
use crate::ingest::{load_billing, read_exclusions, read_prosecutions};
use crate::labels::{
    ExclusionEntry, LabelSet, ProsecutionEntry, collect_fraud_identifiers, resolve_labels,
};
use crate::model::forest::{ForestParams, RandomForest, RandomForestClassifier};
use crate::model::{TrainedModel, TrainingData, train};
use crate::peers::PeerTable;
use crate::records::{BillingLineRecord, IngestTally};
use crate::report::{
    ArtifactPaths, ModelDiagnostics, RunContext, read_diagnostics, read_scored_csv,
    write_run_artifacts, write_threshold_artifacts,
};
use crate::scoring::{RiskScoreRecord, score_providers};

const STEPS: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInputs {
    pub billing: Vec<PathBuf>,
    pub exclusions: PathBuf,
    pub prosecutions: PathBuf,
    pub output_dir: PathBuf,
}

/// Everything a run computes, before anything is written.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub aggregates: Vec<ProviderAggregate>,
    pub vectors: Vec<FeatureVector>,
    pub labels: LabelSet,
    pub model: TrainedModel<RandomForest>,
    pub records: Vec<RiskScoreRecord>,
    pub diagnostics: ModelDiagnostics,
}

pub fn classifier_for(cfg: &PipelineConfig) -> RandomForestClassifier {
    RandomForestClassifier::new(ForestParams {
        trees: cfg.training.trees,
        max_depth: cfg.training.max_depth,
        min_samples_leaf: cfg.training.min_samples_leaf,
    })
}

pub fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:32.magenta/blue}] {pos}/{len} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
    progress.set_prefix("TRAIN");
    progress.enable_steady_tick(Duration::from_millis(250));
    progress
}

pub fn warn_leakage_risk(cfg: &PipelineConfig) {
    for feature in cfg.leakage_risk_features() {
        tracing::warn!(
            feature = feature.name(),
            "feature may leak the label through data availability; exclude it via training.exclude_features"
        );
    }
}

/// Aggregation through scoring on already-loaded inputs.
pub fn execute(
    records: &[BillingLineRecord],
    ingest: IngestTally,
    exclusions: &[ExclusionEntry],
    prosecutions: &[ProsecutionEntry],
    cfg: &PipelineConfig,
    progress: &ProgressBar,
) -> Result<PipelineOutput, PipelineError> {
    tracing::info!("Step 1/{STEPS}: aggregating {} billing rows", records.len());
    let aggregates = aggregate_records(records, cfg.parallelism);
    tracing::info!(providers = aggregates.len(), "aggregated providers");

    tracing::info!("Step 2/{STEPS}: computing specialty peer baselines");
    let peers = PeerTable::build(&aggregates, &cfg.peers);
    tracing::info!(
        specialties = peers.specialty_count(),
        fallbacks = peers.fallbacks().len(),
        "built peer baselines"
    );

    tracing::info!("Step 3/{STEPS}: building feature vectors");
    let vectors = build_feature_vectors(&aggregates, &peers, &cfg.features);

    tracing::info!("Step 4/{STEPS}: resolving training labels");
    let fraud = collect_fraud_identifiers(exclusions, prosecutions)?;
    let labels = resolve_labels(&aggregates, &fraud, &cfg.labels)?;

    tracing::info!("Step 5/{STEPS}: training classifier");
    let data = TrainingData::assemble(&vectors, &labels.labels, &cfg.model_features());
    let classifier = classifier_for(cfg);
    let model = train(&classifier, &data, cfg.training.folds, cfg.seed, progress)?;
    progress.finish_and_clear();
    tracing::info!(
        model_version = %model.model_version,
        mean_auc = model.cross_validation.mean_auc,
        std_auc = model.cross_validation.std_auc,
        "trained classifier"
    );

    tracing::info!("Step 6/{STEPS}: scoring {} providers", aggregates.len());
    let scored = score_providers(&model, &aggregates, &vectors, cfg.scoring.top_risk_factors);

    let context = RunContext {
        ingest,
        labels: labels.report.clone(),
        peer_fallbacks: peers.fallbacks(),
        leakage_risk_features: cfg.leakage_risk_features(),
    };
    let diagnostics = ModelDiagnostics::new(&model, &scored, cfg.threshold, context);

    Ok(PipelineOutput {
        aggregates,
        vectors,
        labels,
        model,
        records: scored,
        diagnostics,
    })
}

pub fn write_output(
    output: &PipelineOutput,
    output_dir: &Path,
) -> Result<ArtifactPaths, PipelineError> {
    tracing::info!(
        "Step 7/{STEPS}: writing artifacts (threshold {}, {} flagged)",
        output.diagnostics.threshold,
        output.diagnostics.flagged_count
    );
    Ok(write_run_artifacts(
        output_dir,
        &output.model,
        &output.records,
        &output.diagnostics,
    )?)
}

/// Full run from files. `cfg` is validated before any input is touched.
pub fn run(
    cfg: &PipelineConfig,
    inputs: &RunInputs,
    quiet: bool,
) -> Result<ArtifactPaths, PipelineError> {
    warn_leakage_risk(cfg);

    tracing::info!("Loading {} billing source(s)", inputs.billing.len());
    let (records, ingest) = load_billing(&inputs.billing, cfg.ingest.max_rejection_rate)?;
    let exclusions = read_exclusions(&inputs.exclusions)?;
    let prosecutions = read_prosecutions(&inputs.prosecutions)?;

    let progress = progress_bar(quiet);
    let output = execute(&records, ingest, &exclusions, &prosecutions, cfg, &progress)?;
    write_output(&output, &inputs.output_dir)
}

/// Re-partitions a previous run's scored set under `threshold` without rescoring.
pub fn rethreshold(
    scored: &Path,
    diagnostics: &Path,
    threshold: f64,
    output_dir: &Path,
) -> Result<ArtifactPaths, PipelineError> {
    validate_threshold(threshold)?;
    let records = read_scored_csv(scored)?;
    let mut diag = read_diagnostics(diagnostics)?;
    if diag.providers_scored != records.len() {
        return Err(ArtifactError::Read {
            path: scored.display().to_string(),
            message: format!(
                "{} scored rows but diagnostics report {} providers scored",
                records.len(),
                diag.providers_scored
            ),
        }
        .into());
    }

    let previous = diag.flagged_count;
    diag.apply_threshold(&records, threshold);
    tracing::info!(
        model_version = %diag.model_version,
        threshold,
        previous_flagged = previous,
        flagged = diag.flagged_count,
        "re-thresholded scored providers"
    );
    Ok(write_threshold_artifacts(output_dir, &records, &diag)?)
}
