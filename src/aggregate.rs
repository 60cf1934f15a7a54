//! Folds billing lines into one aggregate per provider.
//!
//! Every field of [`ProviderAccumulator`] merges with saturating integer
//! addition, set union or per-key addition, so any partitioning of the input
//! folds to the same result. Saturating sums of non-negative terms clamp to
//! `u64::MAX` regardless of grouping, so a fold never overflows.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use crate::common::stable_hash;
use crate::records::{BillingLineRecord, EntityType, cents_to_dollars};

/// Partial totals for one provider. Mergeable in any order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderAccumulator {
    pub paid_cents: u64,
    pub charge_cents: u64,
    pub allowed_cents: u64,
    pub services: u64,
    pub beneficiaries: u64,
    pub record_count: u64,
    pub active_years: BTreeSet<u16>,
    pub code_services: BTreeMap<String, u64>,
    pub specialty_votes: BTreeMap<String, Vote>,
    pub state_votes: BTreeMap<String, Vote>,
    pub entity_votes: BTreeMap<EntityType, Vote>,
}

/// Weight of an attribute value: services billed under it, then rows carrying it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Vote {
    pub services: u64,
    pub rows: u64,
}

impl Vote {
    fn of(record: &BillingLineRecord) -> Self {
        Self {
            services: record.service_count,
            rows: 1,
        }
    }

    fn add(&mut self, other: Vote) {
        self.services = self.services.saturating_add(other.services);
        self.rows = self.rows.saturating_add(other.rows);
    }
}

impl ProviderAccumulator {
    pub fn add(&mut self, record: &BillingLineRecord) {
        self.paid_cents = self.paid_cents.saturating_add(record.paid_amount_cents);
        self.charge_cents = self.charge_cents.saturating_add(record.submitted_charge_cents);
        self.allowed_cents = self.allowed_cents.saturating_add(record.allowed_amount_cents);
        self.services = self.services.saturating_add(record.service_count);
        self.beneficiaries = self.beneficiaries.saturating_add(record.beneficiary_count);
        self.record_count = self.record_count.saturating_add(1);
        if record.service_count > 0 {
            self.active_years.insert(record.year);
        }
        let code = self
            .code_services
            .entry(record.procedure_code.clone())
            .or_default();
        *code = code.saturating_add(record.service_count);
        self.specialty_votes
            .entry(record.specialty.clone())
            .or_default()
            .add(Vote::of(record));
        self.state_votes
            .entry(record.state.clone())
            .or_default()
            .add(Vote::of(record));
        if let Some(entity) = record.entity_type {
            self.entity_votes.entry(entity).or_default().add(Vote::of(record));
        }
    }

    pub fn merge(&mut self, other: ProviderAccumulator) {
        self.paid_cents = self.paid_cents.saturating_add(other.paid_cents);
        self.charge_cents = self.charge_cents.saturating_add(other.charge_cents);
        self.allowed_cents = self.allowed_cents.saturating_add(other.allowed_cents);
        self.services = self.services.saturating_add(other.services);
        self.beneficiaries = self.beneficiaries.saturating_add(other.beneficiaries);
        self.record_count = self.record_count.saturating_add(other.record_count);
        self.active_years.extend(other.active_years);
        for (code, services) in other.code_services {
            let total = self.code_services.entry(code).or_default();
            *total = total.saturating_add(services);
        }
        merge_votes(&mut self.specialty_votes, other.specialty_votes);
        merge_votes(&mut self.state_votes, other.state_votes);
        merge_votes(&mut self.entity_votes, other.entity_votes);
    }

    pub fn finish(self, provider_id: String) -> ProviderAggregate {
        let specialty = winning_vote(&self.specialty_votes).unwrap_or_default();
        let state = winning_vote(&self.state_votes).unwrap_or_default();
        let entity_type = winning_vote(&self.entity_votes);
        ProviderAggregate {
            provider_id,
            specialty,
            state,
            entity_type,
            total_payments_cents: self.paid_cents,
            total_charges_cents: self.charge_cents,
            total_allowed_cents: self.allowed_cents,
            total_services: self.services,
            total_beneficiaries: self.beneficiaries,
            years_active: self.active_years.len() as u32,
            first_year: self.active_years.first().copied(),
            last_year: self.active_years.last().copied(),
            record_count: self.record_count,
            code_services: self.code_services,
        }
    }
}

fn merge_votes<K: Ord>(into: &mut BTreeMap<K, Vote>, from: BTreeMap<K, Vote>) {
    for (key, vote) in from {
        into.entry(key).or_default().add(vote);
    }
}

/// Highest vote wins; equal votes resolve to the smallest key.
fn winning_vote<K: Ord + Clone>(votes: &BTreeMap<K, Vote>) -> Option<K> {
    let mut best: Option<(&K, Vote)> = None;
    for (key, vote) in votes {
        match best {
            Some((_, current)) if *vote <= current => {}
            _ => best = Some((key, *vote)),
        }
    }
    best.map(|(key, _)| key.clone())
}

/// All billing activity of one provider across the full window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAggregate {
    pub provider_id: String,
    pub specialty: String,
    pub state: String,
    pub entity_type: Option<EntityType>,
    pub total_payments_cents: u64,
    pub total_charges_cents: u64,
    pub total_allowed_cents: u64,
    pub total_services: u64,
    pub total_beneficiaries: u64,
    pub years_active: u32,
    pub first_year: Option<u16>,
    pub last_year: Option<u16>,
    pub record_count: u64,
    pub code_services: BTreeMap<String, u64>,
}

impl ProviderAggregate {
    pub fn total_payments(&self) -> f64 {
        cents_to_dollars(self.total_payments_cents)
    }

    pub fn total_charges(&self) -> f64 {
        cents_to_dollars(self.total_charges_cents)
    }
}

pub type PartialAggregates = BTreeMap<String, ProviderAccumulator>;

pub fn fold_records<'a, I>(records: I) -> PartialAggregates
where
    I: IntoIterator<Item = &'a BillingLineRecord>,
{
    let mut partials = PartialAggregates::new();
    for record in records {
        partials
            .entry(record.provider_id.clone())
            .or_default()
            .add(record);
    }
    partials
}

pub fn merge_partials(mut left: PartialAggregates, right: PartialAggregates) -> PartialAggregates {
    for (provider_id, acc) in right {
        match left.get_mut(&provider_id) {
            Some(existing) => existing.merge(acc),
            None => {
                left.insert(provider_id, acc);
            }
        }
    }
    left
}

pub fn finish_partials(partials: PartialAggregates) -> Vec<ProviderAggregate> {
    partials
        .into_iter()
        .map(|(provider_id, acc)| acc.finish(provider_id))
        .collect()
}

/// Shard of a provider id when folding with `shards` workers.
pub fn shard_of(provider_id: &str, shards: usize) -> usize {
    (stable_hash(provider_id.as_bytes()) % shards.max(1) as u64) as usize
}

/// Aggregates on `shards` rayon workers, each owning the providers hashed to it.
///
/// Returned aggregates are sorted by provider id.
pub fn aggregate_records(records: &[BillingLineRecord], shards: usize) -> Vec<ProviderAggregate> {
    let shards = shards.max(1);
    let mut buckets: Vec<Vec<&BillingLineRecord>> = vec![Vec::new(); shards];
    for record in records {
        buckets[shard_of(&record.provider_id, shards)].push(record);
    }

    let merged = buckets
        .into_par_iter()
        .map(|bucket| fold_records(bucket))
        .reduce(PartialAggregates::new, merge_partials);

    let aggregates = finish_partials(merged);
    tracing::debug!(
        providers = aggregates.len(),
        records = records.len(),
        shards,
        "aggregated billing records"
    );
    aggregates
}
