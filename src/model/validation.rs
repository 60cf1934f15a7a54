//! Stratified fold assignment and rank-based discrimination metrics.

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::error::TrainingError;

/// SplitMix64 step, used to give each consumer of the run seed its own stream.
pub fn derive_seed(seed: u64, purpose: u64) -> u64 {
    let mut z = seed ^ purpose.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

pub const FOLD_ASSIGNMENT_PURPOSE: u64 = 0xf01d;

/// Fold index for every sample. Positives and negatives are shuffled separately
/// and dealt round-robin, so each fold keeps the overall label ratio.
pub fn stratified_folds(
    labels: &[bool],
    folds: usize,
    seed: u64,
) -> Result<Vec<usize>, TrainingError> {
    let positives: Vec<usize> = (0..labels.len()).filter(|&i| labels[i]).collect();
    let negatives: Vec<usize> = (0..labels.len()).filter(|&i| !labels[i]).collect();
    if folds < 2 || positives.len() < folds || negatives.len() < folds {
        return Err(TrainingError::InsufficientClassCounts {
            folds,
            positives: positives.len(),
            negatives: negatives.len(),
        });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, FOLD_ASSIGNMENT_PURPOSE));
    let mut assignment = vec![0usize; labels.len()];
    for mut class in [positives, negatives] {
        class.shuffle(&mut rng);
        for (pos, sample) in class.into_iter().enumerate() {
            assignment[sample] = pos % folds;
        }
    }
    Ok(assignment)
}

/// Area under the ROC curve via the Mann-Whitney statistic, averaging tied ranks.
///
/// `None` when either class is absent.
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    let n_pos = labels.iter().filter(|&&l| l).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 || scores.len() != labels.len() {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // 1-based ranks start+1 ..= end share their average
        let avg_rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            if labels[idx] {
                positive_rank_sum += avg_rank;
            }
        }
        start = end;
    }

    let n_pos_f = n_pos as f64;
    let u = positive_rank_sum - n_pos_f * (n_pos_f + 1.0) / 2.0;
    Some(u / (n_pos_f * n_neg as f64))
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auc_of_perfect_and_inverted_rankings() {
        let labels = [false, false, true, true];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels), Some(1.0));
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels), Some(0.0));
    }

    #[test]
    fn auc_counts_ties_as_half() {
        let labels = [false, true];
        assert_eq!(roc_auc(&[0.5, 0.5], &labels), Some(0.5));
        // one positive above both negatives, one tied with a negative
        let labels = [false, false, true, true];
        assert_eq!(roc_auc(&[0.1, 0.5, 0.5, 0.9], &labels), Some(0.875));
    }

    #[test]
    fn auc_needs_both_classes() {
        assert_eq!(roc_auc(&[0.1, 0.2], &[true, true]), None);
    }

    #[test]
    fn folds_are_stratified_and_reproducible() {
        let labels: Vec<bool> = (0..1_000).map(|i| i % 100 == 0).collect();
        let a = stratified_folds(&labels, 5, 42).unwrap();
        let b = stratified_folds(&labels, 5, 42).unwrap();
        assert_eq!(a, b);
        for fold in 0..5 {
            let pos = (0..labels.len()).filter(|&i| a[i] == fold && labels[i]).count();
            let neg = (0..labels.len()).filter(|&i| a[i] == fold && !labels[i]).count();
            assert_eq!(pos, 2);
            assert_eq!(neg, 198);
        }
        assert_ne!(a, stratified_folds(&labels, 5, 43).unwrap());
    }

    #[test]
    fn too_few_positives_is_an_error() {
        let labels: Vec<bool> = (0..100).map(|i| i < 3).collect();
        let err = stratified_folds(&labels, 5, 1).unwrap_err();
        assert_eq!(
            err,
            TrainingError::InsufficientClassCounts {
                folds: 5,
                positives: 3,
                negatives: 97
            }
        );
    }

    #[test]
    fn mean_std_population() {
        let (m, s) = mean_std(&[0.6, 0.8]);
        assert!((m - 0.7).abs() < 1e-12);
        assert!((s - 0.1).abs() < 1e-12);
    }
}
