//! Training labels from confirmed-fraud identifier lists.
//!
//! Every provider with enough billing history gets a label; `is_fraud` is true
//! when its identifier is on the exclusion registry or the prosecution list.
//! Providers below the history minimum stay unlabeled, including listed ones.
//! Two billing providers that resolve to the same identifier are an error.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::aggregate::ProviderAggregate;
use crate::config::LabelConfig;
use crate::error::{FraudSource, LabelConflictError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExclusionEntry {
    #[serde(alias = "NPI", alias = "npi")]
    pub identifier: String,
    #[serde(default, alias = "EXCLDATE")]
    pub exclusion_date: String,
    #[serde(default, alias = "EXCLTYPE")]
    pub reason_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProsecutionEntry {
    #[serde(alias = "NPI", alias = "npi")]
    pub identifier: String,
    #[serde(default)]
    pub case_reference: String,
}

/// Ten-digit NPI form used for all matching. The all-zero placeholder is not an identifier.
pub fn canonical_identifier(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("NPI").map(str::trim).unwrap_or(trimmed);
    (digits.len() == 10
        && digits.bytes().all(|b| b.is_ascii_digit())
        && digits.bytes().any(|b| b != b'0'))
    .then(|| digits.to_string())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FraudEvidence {
    pub excluded: bool,
    pub prosecuted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FraudIdentifiers {
    pub evidence: BTreeMap<String, FraudEvidence>,
    pub malformed: usize,
}

impl FraudIdentifiers {
    pub fn contains(&self, canonical: &str) -> bool {
        self.evidence.contains_key(canonical)
    }

    pub fn len(&self) -> usize {
        self.evidence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evidence.is_empty()
    }
}

/// Merges both sources; any identifier listed twice within one source is fatal.
pub fn collect_fraud_identifiers(
    exclusions: &[ExclusionEntry],
    prosecutions: &[ProsecutionEntry],
) -> Result<FraudIdentifiers, LabelConflictError> {
    let mut out = FraudIdentifiers::default();

    let mut seen_exclusions: BTreeMap<String, (u64, &ExclusionEntry)> = BTreeMap::new();
    for (idx, entry) in exclusions.iter().enumerate() {
        let row = idx as u64 + 1;
        let Some(id) = canonical_identifier(&entry.identifier) else {
            out.malformed += 1;
            continue;
        };
        if let Some((first_row, first)) = seen_exclusions.get(&id) {
            if first.exclusion_date.trim() == entry.exclusion_date.trim()
                && first.reason_code.trim() == entry.reason_code.trim()
            {
                return Err(LabelConflictError::Duplicate {
                    list: FraudSource::ExclusionRegistry,
                    identifier: id,
                    first_row: *first_row,
                    second_row: row,
                });
            }
            return Err(LabelConflictError::Conflict {
                list: FraudSource::ExclusionRegistry,
                identifier: id,
                first: format!("{} {}", first.exclusion_date.trim(), first.reason_code.trim()),
                second: format!("{} {}", entry.exclusion_date.trim(), entry.reason_code.trim()),
            });
        }
        seen_exclusions.insert(id.clone(), (row, entry));
        out.evidence.entry(id).or_default().excluded = true;
    }

    let mut seen_prosecutions: BTreeMap<String, (u64, &ProsecutionEntry)> = BTreeMap::new();
    for (idx, entry) in prosecutions.iter().enumerate() {
        let row = idx as u64 + 1;
        let Some(id) = canonical_identifier(&entry.identifier) else {
            out.malformed += 1;
            continue;
        };
        if let Some((first_row, first)) = seen_prosecutions.get(&id) {
            if first.case_reference.trim() == entry.case_reference.trim() {
                return Err(LabelConflictError::Duplicate {
                    list: FraudSource::Prosecution,
                    identifier: id,
                    first_row: *first_row,
                    second_row: row,
                });
            }
            return Err(LabelConflictError::Conflict {
                list: FraudSource::Prosecution,
                identifier: id,
                first: first.case_reference.trim().to_string(),
                second: entry.case_reference.trim().to_string(),
            });
        }
        seen_prosecutions.insert(id.clone(), (row, entry));
        out.evidence.entry(id).or_default().prosecuted = true;
    }

    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub provider_id: String,
    pub is_fraud: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelReport {
    pub fraud_identifiers: usize,
    pub malformed_identifiers: usize,
    pub labeled: usize,
    pub positives: usize,
    pub negatives: usize,
    pub unlabeled_providers: usize,
    /// Listed providers left out of training for lack of billing history.
    pub excluded_insufficient_history: usize,
    pub excluded_provider_ids: Vec<String>,
    /// Listed identifiers with no billing at all.
    pub unmatched_identifiers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    pub labels: Vec<Label>,
    pub report: LabelReport,
}

pub fn has_sufficient_history(agg: &ProviderAggregate, cfg: &LabelConfig) -> bool {
    agg.total_services >= cfg.min_total_services && agg.years_active >= cfg.min_years_active
}

pub fn resolve_labels(
    aggregates: &[ProviderAggregate],
    fraud: &FraudIdentifiers,
    cfg: &LabelConfig,
) -> Result<LabelSet, LabelConflictError> {
    let mut labels = Vec::new();
    let mut report = LabelReport {
        fraud_identifiers: fraud.len(),
        malformed_identifiers: fraud.malformed,
        ..LabelReport::default()
    };
    let mut matched: BTreeSet<String> = BTreeSet::new();
    let mut owners: BTreeMap<String, &str> = BTreeMap::new();

    for agg in aggregates {
        let canonical = canonical_identifier(&agg.provider_id);
        if let Some(id) = &canonical {
            if let Some(first) = owners.insert(id.clone(), &agg.provider_id) {
                return Err(LabelConflictError::AmbiguousProvider {
                    identifier: id.clone(),
                    first: first.to_string(),
                    second: agg.provider_id.clone(),
                });
            }
        }
        let listed = canonical.as_deref().is_some_and(|id| fraud.contains(id));
        if listed {
            if let Some(id) = canonical {
                matched.insert(id);
            }
        }

        if !has_sufficient_history(agg, cfg) {
            report.unlabeled_providers += 1;
            if listed {
                report.excluded_insufficient_history += 1;
                report.excluded_provider_ids.push(agg.provider_id.clone());
            }
            continue;
        }

        labels.push(Label {
            provider_id: agg.provider_id.clone(),
            is_fraud: listed,
        });
        if listed {
            report.positives += 1;
        } else {
            report.negatives += 1;
        }
    }

    report.labeled = labels.len();
    report.unmatched_identifiers = fraud
        .evidence
        .keys()
        .filter(|id| !matched.contains(*id))
        .count();

    tracing::info!(
        labeled = report.labeled,
        positives = report.positives,
        unlabeled = report.unlabeled_providers,
        unmatched_identifiers = report.unmatched_identifiers,
        "resolved training labels"
    );
    if report.excluded_insufficient_history > 0 {
        tracing::warn!(
            excluded = report.excluded_insufficient_history,
            min_total_services = cfg.min_total_services,
            min_years_active = cfg.min_years_active,
            "listed providers excluded from training for insufficient billing history"
        );
    }

    Ok(LabelSet { labels, report })
}
