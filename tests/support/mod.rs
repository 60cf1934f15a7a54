#![allow(dead_code)]

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use provider_risk::config::{Overrides, PipelineConfig};
use provider_risk::labels::{ExclusionEntry, ProsecutionEntry};
use provider_risk::records::{BillingLineRecord, EntityType};

pub const SPECIALTY: &str = "Internal Medicine";
pub const PAYMENT_OUTLIER: &str = "3000000001";
pub const SHORT_HISTORY_FRAUD: &str = "4000000001";
pub const SPB_OUTLIER: &str = "5000000001";

pub fn normal_id(i: usize) -> String {
    format!("1{i:09}")
}

pub fn fraud_id(i: usize) -> String {
    format!("2{i:09}")
}

pub fn line(
    provider: &str,
    year: u16,
    services: u64,
    beneficiaries: u64,
    paid_cents: u64,
) -> BillingLineRecord {
    BillingLineRecord {
        provider_id: provider.to_string(),
        year,
        procedure_code: "99213".to_string(),
        service_count: services,
        beneficiary_count: beneficiaries,
        submitted_charge_cents: paid_cents * 2,
        allowed_amount_cents: paid_cents + paid_cents / 2,
        paid_amount_cents: paid_cents,
        specialty: SPECIALTY.to_string(),
        state: if provider.ends_with('1') { "TX" } else { "OH" }.to_string(),
        entity_type: Some(EntityType::Individual),
    }
}

/// Two years of identical billing apart from the payment total.
pub fn two_year_provider(
    provider: &str,
    services: u64,
    beneficiaries: u64,
    paid_dollars: u64,
) -> Vec<BillingLineRecord> {
    let per_year = paid_dollars * 100 / 2;
    vec![
        line(provider, 2021, services / 2, beneficiaries / 2, per_year),
        line(provider, 2022, services / 2, beneficiaries / 2, per_year),
    ]
}

pub fn exclusion(id: &str) -> ExclusionEntry {
    ExclusionEntry {
        identifier: id.to_string(),
        exclusion_date: "2023-01-01".to_string(),
        reason_code: "1128a1".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Population {
    pub records: Vec<BillingLineRecord>,
    pub exclusions: Vec<ExclusionEntry>,
    pub prosecutions: Vec<ProsecutionEntry>,
}

/// 60 ordinary providers near $100k, 10 listed providers at $600k-$780k, a
/// $900k unlisted provider active for a single year, and a listed provider
/// whose single year of billing is below the history minimum.
pub fn payment_population() -> Population {
    let mut records = Vec::new();
    for i in 0..60 {
        let paid = 90_000 + (i as u64 % 21) * 1_000;
        records.extend(two_year_provider(&normal_id(i), 1_000, 200, paid));
    }
    let mut exclusions = Vec::new();
    for i in 0..10 {
        records.extend(two_year_provider(&fraud_id(i), 1_000, 200, 600_000 + i as u64 * 20_000));
        exclusions.push(exclusion(&fraud_id(i)));
    }
    records.push(line(PAYMENT_OUTLIER, 2022, 1_000, 200, 900_000 * 100));
    records.push(line(SHORT_HISTORY_FRAUD, 2022, 1_000, 200, 100_000 * 100));
    exclusions.push(exclusion(SHORT_HISTORY_FRAUD));
    Population {
        records,
        exclusions,
        prosecutions: Vec::new(),
    }
}

/// Listed providers bill ten times as many services per beneficiary as their
/// peers; one unlisted provider bills 300 services to a single beneficiary.
pub fn utilization_population() -> Population {
    let mut records = Vec::new();
    for i in 0..60 {
        records.extend(two_year_provider(&normal_id(i), 1_000, 200, 100_000));
    }
    let mut prosecutions = Vec::new();
    for i in 0..10 {
        records.extend(two_year_provider(&fraud_id(i), 1_000, 20, 100_000));
        prosecutions.push(ProsecutionEntry {
            identifier: fraud_id(i),
            case_reference: format!("US v. Provider {i}"),
        });
    }
    records.push(line(SPB_OUTLIER, 2022, 300, 1, 30_000 * 100));
    Population {
        records,
        exclusions: Vec::new(),
        prosecutions,
    }
}

pub fn config(threshold: f64, extra: &str) -> PipelineConfig {
    let raw = format!(
        r#"
        [run]
        seed = 42
        threshold = {threshold:?}
        parallelism = 4

        [peers]
        min_peer_count = 30

        [labels]
        min_total_services = 100
        min_years_active = 2

        [training]
        folds = 5
        trees = 40
        max_depth = 6
        min_samples_leaf = 1

        {extra}
        "#
    );
    PipelineConfig::from_toml_str(&raw, "test", &Overrides::default()).expect("test config")
}

pub fn write_billing_csv(dir: &Path, records: &[BillingLineRecord]) -> PathBuf {
    let mut body = String::from(
        "provider_id,year,procedure_code,service_count,beneficiary_count,submitted_charge_total,allowed_amount_total,paid_amount_total,specialty,state,entity_type\n",
    );
    for r in records {
        let dollars = |cents: u64| format!("{}.{:02}", cents / 100, cents % 100);
        writeln!(
            body,
            "{},{},{},{},{},{},{},{},{},{},{}",
            r.provider_id,
            r.year,
            r.procedure_code,
            r.service_count,
            r.beneficiary_count,
            dollars(r.submitted_charge_cents),
            dollars(r.allowed_amount_cents),
            dollars(r.paid_amount_cents),
            r.specialty,
            r.state,
            r.entity_type.map(|e| e.as_str()).unwrap_or("")
        )
        .unwrap();
    }
    let path = dir.join("billing.csv");
    fs::write(&path, body).unwrap();
    path
}

pub fn write_exclusions_csv(dir: &Path, entries: &[ExclusionEntry]) -> PathBuf {
    let mut body = String::from("identifier,exclusion_date,reason_code\n");
    for e in entries {
        writeln!(body, "{},{},{}", e.identifier, e.exclusion_date, e.reason_code).unwrap();
    }
    let path = dir.join("exclusions.csv");
    fs::write(&path, body).unwrap();
    path
}

pub fn write_prosecutions_csv(dir: &Path, entries: &[ProsecutionEntry]) -> PathBuf {
    let mut body = String::from("identifier,case_reference\n");
    for e in entries {
        writeln!(body, "{},{}", e.identifier, e.case_reference).unwrap();
    }
    let path = dir.join("prosecutions.csv");
    fs::write(&path, body).unwrap();
    path
}
