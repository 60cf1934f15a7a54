//! Supervised fraud classifier: cross-validated training behind a narrow trait.

pub mod forest;
pub mod validation;

use std::collections::BTreeMap;

use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};

use crate::common::{Fingerprint, encode_hex};
use crate::constants::FEATURE_SCHEMA_VERSION;
use crate::error::TrainingError;
use crate::features::{FeatureId, FeatureVector};
use crate::labels::Label;
use validation::{derive_seed, mean_std, roc_auc, stratified_folds};

/// A training strategy. Implementations must be deterministic in `seed`.
pub trait Classifier: Sync {
    type Model: FittedModel;

    fn name(&self) -> &'static str;

    /// Name plus hyperparameters; part of the model fingerprint.
    fn describe(&self) -> String;

    fn fit(
        &self,
        rows: &[Vec<f64>],
        labels: &[bool],
        seed: u64,
    ) -> Result<Self::Model, TrainingError>;
}

pub trait FittedModel: Send + Sync {
    /// Probability of the positive class, in [0, 1].
    fn predict_proba(&self, row: &[f64]) -> f64;

    /// One weight per input column, summing to 1.
    fn feature_importance(&self) -> &[f64];
}

/// Labeled rows in the column order of `features`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingData {
    pub features: Vec<FeatureId>,
    pub provider_ids: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<bool>,
}

impl TrainingData {
    /// Joins labels to feature vectors by provider id. Labels without a vector are skipped.
    pub fn assemble(vectors: &[FeatureVector], labels: &[Label], features: &[FeatureId]) -> Self {
        let by_id: BTreeMap<&str, &FeatureVector> =
            vectors.iter().map(|fv| (fv.provider_id.as_str(), fv)).collect();
        let mut data = Self {
            features: features.to_vec(),
            provider_ids: Vec::with_capacity(labels.len()),
            rows: Vec::with_capacity(labels.len()),
            labels: Vec::with_capacity(labels.len()),
        };
        for label in labels {
            let Some(fv) = by_id.get(label.provider_id.as_str()) else {
                continue;
            };
            data.provider_ids.push(label.provider_id.clone());
            data.rows.push(fv.row(features));
            data.labels.push(label.is_fraud);
        }
        data
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&l| l).count()
    }

    fn subset(&self, indices: &[usize]) -> (Vec<Vec<f64>>, Vec<bool>) {
        let rows = indices.iter().map(|&i| self.rows[i].clone()).collect();
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        (rows, labels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldSize {
    pub examples: usize,
    pub positives: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidation {
    pub folds: usize,
    pub fold_auc: Vec<f64>,
    pub mean_auc: f64,
    pub std_auc: f64,
    pub fold_sizes: Vec<FoldSize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeight {
    pub feature: FeatureId,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel<M> {
    pub model_version: String,
    pub schema_version: String,
    pub classifier: String,
    pub seed: u64,
    pub features: Vec<FeatureId>,
    pub training_examples: usize,
    pub positives: usize,
    pub cross_validation: CrossValidation,
    pub feature_importance: Vec<FeatureWeight>,
    pub model: M,
}

impl<M: FittedModel> TrainedModel<M> {
    pub fn predict(&self, fv: &FeatureVector) -> f64 {
        self.model.predict_proba(&fv.row(&self.features)).clamp(0.0, 1.0)
    }

    /// Zero for features the model was not trained on.
    pub fn importance_of(&self, feature: FeatureId) -> f64 {
        self.feature_importance
            .iter()
            .find(|w| w.feature == feature)
            .map(|w| w.weight)
            .unwrap_or(0.0)
    }
}

/// Fingerprint of everything that determines the fitted model.
pub fn model_version(describe: &str, data: &TrainingData, folds: usize, seed: u64) -> String {
    let mut fingerprint = Fingerprint::default();
    fingerprint.update_str(FEATURE_SCHEMA_VERSION);
    fingerprint.update_str(describe);
    fingerprint.update_u64(folds as u64);
    fingerprint.update_u64(seed);
    for feature in &data.features {
        fingerprint.update_str(feature.name());
    }
    for ((id, row), label) in data.provider_ids.iter().zip(&data.rows).zip(&data.labels) {
        fingerprint.update_str(id);
        for value in row {
            fingerprint.update_f64(*value);
        }
        fingerprint.update(&[u8::from(*label)]);
    }
    let digest = fingerprint.finish();
    format!("{FEATURE_SCHEMA_VERSION}-{}", encode_hex(&digest[..8]))
}

/// Stratified k-fold evaluation followed by a final fit on every labeled example.
pub fn train<C: Classifier>(
    classifier: &C,
    data: &TrainingData,
    folds: usize,
    seed: u64,
    progress: &ProgressBar,
) -> Result<TrainedModel<C::Model>, TrainingError> {
    let assignment = stratified_folds(&data.labels, folds, seed)?;
    progress.set_length(folds as u64 + 1);
    progress.set_position(0);

    let mut fold_auc = Vec::with_capacity(folds);
    let mut fold_sizes = Vec::with_capacity(folds);
    for fold in 0..folds {
        progress.set_message(format!("fold {}/{folds}", fold + 1));
        let (train_idx, valid_idx): (Vec<usize>, Vec<usize>) =
            (0..data.len()).partition(|&i| assignment[i] != fold);
        let (train_rows, train_labels) = data.subset(&train_idx);
        let (valid_rows, valid_labels) = data.subset(&valid_idx);

        let model = classifier.fit(&train_rows, &train_labels, derive_seed(seed, fold as u64 + 1))?;
        let scores: Vec<f64> = valid_rows.iter().map(|row| model.predict_proba(row)).collect();
        let positives = valid_labels.iter().filter(|&&l| l).count();
        let auc = roc_auc(&scores, &valid_labels).ok_or(TrainingError::DegenerateFold {
            fold,
            positives,
            negatives: valid_labels.len() - positives,
        })?;

        tracing::info!(
            fold = fold + 1,
            examples = valid_labels.len(),
            positives,
            auc,
            "cross-validation fold scored"
        );
        fold_auc.push(auc);
        fold_sizes.push(FoldSize {
            examples: valid_labels.len(),
            positives,
        });
        progress.inc(1);
    }

    progress.set_message("final fit");
    let model = classifier.fit(&data.rows, &data.labels, derive_seed(seed, 0))?;
    progress.inc(1);

    let (mean_auc, std_auc) = mean_std(&fold_auc);
    let feature_importance = data
        .features
        .iter()
        .zip(model.feature_importance())
        .map(|(feature, weight)| FeatureWeight {
            feature: *feature,
            weight: *weight,
        })
        .collect();

    Ok(TrainedModel {
        model_version: model_version(&classifier.describe(), data, folds, seed),
        schema_version: FEATURE_SCHEMA_VERSION.to_string(),
        classifier: classifier.name().to_string(),
        seed,
        features: data.features.clone(),
        training_examples: data.len(),
        positives: data.positives(),
        cross_validation: CrossValidation {
            folds,
            fold_auc,
            mean_auc,
            std_auc,
            fold_sizes,
        },
        feature_importance,
        model,
    })
}

#[cfg(test)]
mod tests {
    use super::forest::{ForestParams, RandomForestClassifier};
    use super::*;

    fn data(n: usize) -> TrainingData {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        let mut ids = Vec::new();
        for i in 0..n {
            let positive = i % 8 == 0;
            let signal = if positive { 5.0 + (i % 3) as f64 } else { (i % 4) as f64 };
            rows.push(vec![signal, (i % 13) as f64]);
            labels.push(positive);
            ids.push(format!("{i:010}"));
        }
        TrainingData {
            features: vec![FeatureId::ZPayment, FeatureId::DistinctCodes],
            provider_ids: ids,
            rows,
            labels,
        }
    }

    fn classifier() -> RandomForestClassifier {
        RandomForestClassifier::new(ForestParams {
            trees: 15,
            max_depth: 5,
            min_samples_leaf: 1,
        })
    }

    #[test]
    fn cross_validation_reports_every_fold() {
        let trained = train(&classifier(), &data(160), 4, 11, &ProgressBar::hidden()).unwrap();
        let cv = &trained.cross_validation;
        assert_eq!(cv.fold_auc.len(), 4);
        assert_eq!(cv.fold_sizes.iter().map(|f| f.examples).sum::<usize>(), 160);
        assert_eq!(cv.fold_sizes.iter().map(|f| f.positives).sum::<usize>(), 20);
        assert!(cv.mean_auc > 0.9, "{cv:?}");
        let total: f64 = trained.feature_importance.iter().map(|w| w.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(
            trained.importance_of(FeatureId::ZPayment)
                > trained.importance_of(FeatureId::DistinctCodes)
        );
        assert_eq!(trained.importance_of(FeatureId::YearsActive), 0.0);
    }

    #[test]
    fn training_is_reproducible_and_seed_sensitive() {
        let d = data(120);
        let a = train(&classifier(), &d, 3, 5, &ProgressBar::hidden()).unwrap();
        let b = train(&classifier(), &d, 3, 5, &ProgressBar::hidden()).unwrap();
        assert_eq!(a, b);
        let digest = a.model_version.strip_prefix("fv-2-").unwrap();
        assert_eq!(digest.len(), 16);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
        let c = train(&classifier(), &d, 3, 6, &ProgressBar::hidden()).unwrap();
        assert_ne!(a.model_version, c.model_version);
    }

    #[test]
    fn too_few_positives_for_folds_is_fatal() {
        let mut d = data(40);
        d.labels = (0..40).map(|i| i < 3).collect();
        let err = train(&classifier(), &d, 5, 1, &ProgressBar::hidden()).unwrap_err();
        assert!(matches!(err, TrainingError::InsufficientClassCounts { positives: 3, .. }));
    }

    #[test]
    fn assemble_joins_labels_to_vectors() {
        let fv = |id: &str, z: f64| FeatureVector {
            provider_id: id.to_string(),
            total_payments: 0.0,
            total_services: 0.0,
            total_beneficiaries: 0.0,
            markup_ratio: 0.0,
            services_per_beneficiary: 0.0,
            payment_per_service: 0.0,
            payment_per_beneficiary: 0.0,
            z_payment: z,
            z_services: 0.0,
            z_markup: 0.0,
            z_services_per_beneficiary: 0.0,
            code_concentration: 0.0,
            distinct_codes: 3.0,
            upcoding_ratio: 0.0,
            wound_care_share: 0.0,
            covid_test_share: 0.0,
            personal_care_share: 0.0,
            services_per_day: 0.0,
            years_active: 1.0,
            markup_undefined: false,
            per_service_undefined: false,
            per_beneficiary_undefined: false,
            upcoding_undefined: true,
        };
        let vectors = vec![fv("a", 1.5), fv("b", -0.5), fv("c", 0.0)];
        let labels = vec![
            Label {
                provider_id: "c".to_string(),
                is_fraud: false,
            },
            Label {
                provider_id: "a".to_string(),
                is_fraud: true,
            },
        ];
        let d = TrainingData::assemble(
            &vectors,
            &labels,
            &[FeatureId::ZPayment, FeatureId::UpcodingUndefined],
        );
        assert_eq!(d.provider_ids, vec!["c".to_string(), "a".to_string()]);
        assert_eq!(d.rows, vec![vec![0.0, 1.0], vec![1.5, 1.0]]);
        assert_eq!(d.labels, vec![false, true]);
    }
}
