//! Specialty peer-group statistics and peer-relative z-scores.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::ProviderAggregate;
use crate::config::PeerConfig;

/// `numerator / denominator`, or `(0.0, true)` when the denominator is zero.
pub fn safe_ratio(numerator: f64, denominator: f64) -> (f64, bool) {
    if denominator == 0.0 {
        return (0.0, true);
    }
    let value = numerator / denominator;
    if value.is_finite() {
        (value, false)
    } else {
        (0.0, true)
    }
}

/// The four quantities compared against specialty peers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerQuantities {
    pub payments: f64,
    pub services: f64,
    pub markup: f64,
    pub services_per_beneficiary: f64,
}

impl PeerQuantities {
    pub fn of(agg: &ProviderAggregate) -> Self {
        let (markup, _) = safe_ratio(agg.total_charges(), agg.total_payments());
        let (services_per_beneficiary, _) =
            safe_ratio(agg.total_services as f64, agg.total_beneficiaries as f64);
        Self {
            payments: agg.total_payments(),
            services: agg.total_services as f64,
            markup,
            services_per_beneficiary,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub median: f64,
    pub std_dev: f64,
}

impl Spread {
    /// Median and population standard deviation. Empty input gives zeros.
    pub fn of(values: &mut [f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);
        let n = values.len();
        let median = if n % 2 == 1 {
            values[n / 2]
        } else {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        };
        let mean = values.iter().sum::<f64>() / n as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        Self {
            median,
            std_dev: variance.sqrt(),
        }
    }

    pub fn z(&self, value: f64, std_floor: f64) -> f64 {
        (value - self.median) / self.std_dev.max(std_floor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerGroupStats {
    pub peer_count: usize,
    pub payments: Spread,
    pub services: Spread,
    pub markup: Spread,
    pub services_per_beneficiary: Spread,
}

impl PeerGroupStats {
    pub fn from_quantities(quantities: &[PeerQuantities]) -> Self {
        let column = |pick: fn(&PeerQuantities) -> f64| -> Spread {
            let mut values: Vec<f64> = quantities.iter().map(pick).collect();
            Spread::of(&mut values)
        };
        Self {
            peer_count: quantities.len(),
            payments: column(|q| q.payments),
            services: column(|q| q.services),
            markup: column(|q| q.markup),
            services_per_beneficiary: column(|q| q.services_per_beneficiary),
        }
    }
}

/// Baseline a specialty is normalized against.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerBaseline {
    Sufficient(PeerGroupStats),
    /// Too few peers for stable statistics; the cross-specialty baseline is used.
    Insufficient {
        peer_count: usize,
        fallback: PeerGroupStats,
    },
}

impl PeerBaseline {
    pub fn stats(&self) -> &PeerGroupStats {
        match self {
            PeerBaseline::Sufficient(stats) => stats,
            PeerBaseline::Insufficient { fallback, .. } => fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, PeerBaseline::Insufficient { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerZScores {
    pub z_payment: f64,
    pub z_services: f64,
    pub z_markup: f64,
    pub z_services_per_beneficiary: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFallback {
    pub specialty: String,
    pub peer_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerTable {
    groups: BTreeMap<String, PeerBaseline>,
    global: PeerGroupStats,
    std_floor: f64,
}

impl PeerTable {
    /// Full pass over every aggregate; z-scores are only available afterwards.
    pub fn build(aggregates: &[ProviderAggregate], cfg: &PeerConfig) -> Self {
        let mut by_specialty: BTreeMap<&str, Vec<PeerQuantities>> = BTreeMap::new();
        let mut all = Vec::with_capacity(aggregates.len());
        for agg in aggregates {
            let q = PeerQuantities::of(agg);
            by_specialty.entry(agg.specialty.as_str()).or_default().push(q);
            all.push(q);
        }
        let global = PeerGroupStats::from_quantities(&all);

        let mut groups = BTreeMap::new();
        for (specialty, quantities) in by_specialty {
            let baseline = if quantities.len() >= cfg.min_peer_count {
                PeerBaseline::Sufficient(PeerGroupStats::from_quantities(&quantities))
            } else {
                tracing::warn!(
                    specialty,
                    peer_count = quantities.len(),
                    min_peer_count = cfg.min_peer_count,
                    "specialty below minimum peer count; using global baseline"
                );
                PeerBaseline::Insufficient {
                    peer_count: quantities.len(),
                    fallback: global.clone(),
                }
            };
            groups.insert(specialty.to_string(), baseline);
        }

        Self {
            groups,
            global,
            std_floor: cfg.std_floor,
        }
    }

    pub fn baseline(&self, specialty: &str) -> Option<&PeerBaseline> {
        self.groups.get(specialty)
    }

    pub fn global(&self) -> &PeerGroupStats {
        &self.global
    }

    pub fn z_scores(&self, agg: &ProviderAggregate) -> PeerZScores {
        let stats = match self.baseline(&agg.specialty) {
            Some(baseline) => baseline.stats(),
            None => &self.global,
        };
        let q = PeerQuantities::of(agg);
        let floor = self.std_floor;
        PeerZScores {
            z_payment: stats.payments.z(q.payments, floor),
            z_services: stats.services.z(q.services, floor),
            z_markup: stats.markup.z(q.markup, floor),
            z_services_per_beneficiary: stats
                .services_per_beneficiary
                .z(q.services_per_beneficiary, floor),
        }
    }

    pub fn fallbacks(&self) -> Vec<PeerFallback> {
        self.groups
            .iter()
            .filter_map(|(specialty, baseline)| match baseline {
                PeerBaseline::Insufficient { peer_count, .. } => Some(PeerFallback {
                    specialty: specialty.clone(),
                    peer_count: *peer_count,
                }),
                PeerBaseline::Sufficient(_) => None,
            })
            .collect()
    }

    pub fn specialty_count(&self) -> usize {
        self.groups.len()
    }
}
