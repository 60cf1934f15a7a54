//! Fraud probabilities for every provider, a deterministic ranking, and the
//! features that drove each score.

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::ProviderAggregate;
use crate::features::{FeatureId, FeatureKind, FeatureVector};
use crate::model::{FittedModel, TrainedModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub feature: FeatureId,
    pub label: String,
    pub contribution: f64,
}

impl RiskFactor {
    pub fn new(feature: FeatureId, contribution: f64) -> Self {
        Self {
            feature,
            label: feature.label().to_string(),
            contribution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScoreRecord {
    pub provider_id: String,
    pub fraud_probability: f64,
    /// Dense rank: providers with equal probability share a rank.
    pub rank: u64,
    /// Unique 1-based position in the total order.
    pub position: u64,
    pub specialty: String,
    pub state: String,
    pub entity_type: Option<String>,
    pub total_payments: f64,
    pub total_services: u64,
    pub total_beneficiaries: u64,
    pub markup_ratio: f64,
    pub services_per_beneficiary: f64,
    pub top_risk_factors: Vec<RiskFactor>,
}

/// How strongly a feature value points toward risk, in [0, 1].
///
/// Raw magnitudes and ratios are explained through their peer z-scores instead.
fn risk_signal(feature: FeatureId, value: f64) -> Option<f64> {
    match feature.kind() {
        FeatureKind::PeerZ => {
            let z = value.max(0.0);
            Some(z / (1.0 + z))
        }
        FeatureKind::Share | FeatureKind::Flag => Some(value.clamp(0.0, 1.0)),
        FeatureKind::Magnitude | FeatureKind::Ratio => None,
    }
}

/// The `top_n` largest positive contributions, ties in schema order.
pub fn top_risk_factors<M: FittedModel>(
    model: &TrainedModel<M>,
    fv: &FeatureVector,
    top_n: usize,
) -> Vec<RiskFactor> {
    let mut factors: Vec<RiskFactor> = model
        .features
        .iter()
        .filter_map(|&feature| {
            let signal = risk_signal(feature, fv.value(feature))?;
            let contribution = model.importance_of(feature) * signal;
            (contribution > 0.0).then(|| RiskFactor::new(feature, contribution))
        })
        .collect();
    factors.sort_by(|a, b| {
        b.contribution
            .total_cmp(&a.contribution)
            .then_with(|| a.feature.index().cmp(&b.feature.index()))
    });
    factors.truncate(top_n);
    factors
}

/// Probability desc, total payments desc, provider id asc.
pub fn ranking_order(a: &RiskScoreRecord, b: &RiskScoreRecord) -> Ordering {
    b.fraud_probability
        .total_cmp(&a.fraud_probability)
        .then_with(|| b.total_payments.total_cmp(&a.total_payments))
        .then_with(|| a.provider_id.cmp(&b.provider_id))
}

/// Sorts into the total order and assigns dense ranks and positions.
pub fn rank_records(mut records: Vec<RiskScoreRecord>) -> Vec<RiskScoreRecord> {
    records.sort_by(ranking_order);
    let mut rank = 0;
    let mut previous: Option<f64> = None;
    for (idx, record) in records.iter_mut().enumerate() {
        if previous != Some(record.fraud_probability) {
            rank += 1;
            previous = Some(record.fraud_probability);
        }
        record.rank = rank;
        record.position = idx as u64 + 1;
    }
    records
}

/// Scores every provider, labeled or not. `vectors[i]` must describe `aggregates[i]`.
pub fn score_providers<M: FittedModel>(
    model: &TrainedModel<M>,
    aggregates: &[ProviderAggregate],
    vectors: &[FeatureVector],
    top_n: usize,
) -> Vec<RiskScoreRecord> {
    debug_assert_eq!(aggregates.len(), vectors.len());
    let records: Vec<RiskScoreRecord> = aggregates
        .par_iter()
        .zip(vectors.par_iter())
        .map(|(agg, fv)| {
            debug_assert_eq!(agg.provider_id, fv.provider_id);
            RiskScoreRecord {
                provider_id: agg.provider_id.clone(),
                fraud_probability: model.predict(fv),
                rank: 0,
                position: 0,
                specialty: agg.specialty.clone(),
                state: agg.state.clone(),
                entity_type: agg.entity_type.map(|e| e.as_str().to_string()),
                total_payments: agg.total_payments(),
                total_services: agg.total_services,
                total_beneficiaries: agg.total_beneficiaries,
                markup_ratio: fv.markup_ratio,
                services_per_beneficiary: fv.services_per_beneficiary,
                top_risk_factors: top_risk_factors(model, fv, top_n),
            }
        })
        .collect();
    rank_records(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CrossValidation, FeatureWeight};

    struct Fixed {
        importance: Vec<f64>,
    }

    impl FittedModel for Fixed {
        fn predict_proba(&self, row: &[f64]) -> f64 {
            row[0]
        }

        fn feature_importance(&self) -> &[f64] {
            &self.importance
        }
    }

    fn model(weights: &[(FeatureId, f64)]) -> TrainedModel<Fixed> {
        TrainedModel {
            model_version: "fv-2-test".to_string(),
            schema_version: "fv-2".to_string(),
            classifier: "fixed".to_string(),
            seed: 0,
            features: weights.iter().map(|(f, _)| *f).collect(),
            training_examples: 0,
            positives: 0,
            cross_validation: CrossValidation {
                folds: 0,
                fold_auc: Vec::new(),
                mean_auc: 0.0,
                std_auc: 0.0,
                fold_sizes: Vec::new(),
            },
            feature_importance: weights
                .iter()
                .map(|(feature, weight)| FeatureWeight {
                    feature: *feature,
                    weight: *weight,
                })
                .collect(),
            model: Fixed {
                importance: weights.iter().map(|(_, w)| *w).collect(),
            },
        }
    }

    fn record(id: &str, probability: f64, payments: f64) -> RiskScoreRecord {
        RiskScoreRecord {
            provider_id: id.to_string(),
            fraud_probability: probability,
            rank: 0,
            position: 0,
            specialty: "Family Practice".to_string(),
            state: "OH".to_string(),
            entity_type: None,
            total_payments: payments,
            total_services: 0,
            total_beneficiaries: 0,
            markup_ratio: 0.0,
            services_per_beneficiary: 0.0,
            top_risk_factors: Vec::new(),
        }
    }

    fn vector(z_payment: f64, covid_share: f64, markup_undefined: bool) -> FeatureVector {
        FeatureVector {
            provider_id: "1000000001".to_string(),
            total_payments: 1e6,
            total_services: 10.0,
            total_beneficiaries: 2.0,
            markup_ratio: 2.0,
            services_per_beneficiary: 5.0,
            payment_per_service: 1e5,
            payment_per_beneficiary: 5e5,
            z_payment,
            z_services: -1.0,
            z_markup: 0.0,
            z_services_per_beneficiary: 0.0,
            code_concentration: 1.0,
            distinct_codes: 1.0,
            upcoding_ratio: 0.0,
            wound_care_share: 0.0,
            covid_test_share: covid_share,
            personal_care_share: 0.0,
            services_per_day: 0.02,
            years_active: 2.0,
            markup_undefined,
            per_service_undefined: false,
            per_beneficiary_undefined: false,
            upcoding_undefined: true,
        }
    }

    #[test]
    fn ties_on_probability_break_by_payments_then_id() {
        let ranked = rank_records(vec![
            record("c", 0.5, 100.0),
            record("b", 0.9, 10.0),
            record("a", 0.5, 100.0),
            record("d", 0.5, 900.0),
            record("e", 0.1, 1.0),
        ]);
        let order: Vec<(&str, u64, u64)> = ranked
            .iter()
            .map(|r| (r.provider_id.as_str(), r.rank, r.position))
            .collect();
        assert_eq!(
            order,
            vec![("b", 1, 1), ("d", 2, 2), ("a", 2, 3), ("c", 2, 4), ("e", 3, 5)]
        );
    }

    #[test]
    fn risk_factors_weight_signal_by_importance() {
        let m = model(&[
            (FeatureId::TotalPayments, 0.4),
            (FeatureId::ZPayment, 0.3),
            (FeatureId::CovidTestShare, 0.2),
            (FeatureId::MarkupUndefined, 0.1),
        ]);
        // z = 3 gives signal 0.75
        let factors = top_risk_factors(&m, &vector(3.0, 0.5, true), 3);
        let got: Vec<(FeatureId, f64)> =
            factors.iter().map(|f| (f.feature, f.contribution)).collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].0, FeatureId::ZPayment);
        assert!((got[0].1 - 0.225).abs() < 1e-12);
        assert_eq!(got[1].0, FeatureId::CovidTestShare);
        assert!((got[1].1 - 0.1).abs() < 1e-12);
        assert_eq!(got[2].0, FeatureId::MarkupUndefined);
        assert_eq!(factors[0].label, FeatureId::ZPayment.label());
    }

    #[test]
    fn negative_z_and_zero_shares_are_not_risk_factors() {
        let m = model(&[
            (FeatureId::ZPayment, 0.5),
            (FeatureId::ZServices, 0.3),
            (FeatureId::CovidTestShare, 0.2),
        ]);
        assert!(top_risk_factors(&m, &vector(-2.0, 0.0, false), 3).is_empty());
    }

    #[test]
    fn equal_contributions_keep_schema_order() {
        let m = model(&[(FeatureId::UpcodingUndefined, 0.5), (FeatureId::CodeConcentration, 0.5)]);
        let factors = top_risk_factors(&m, &vector(0.0, 0.0, false), 1);
        assert_eq!(factors.len(), 1);
        assert_eq!(factors[0].feature, FeatureId::CodeConcentration);
    }
}
