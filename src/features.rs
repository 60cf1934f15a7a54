//! Fixed-schema feature vectors built from a provider aggregate and its peer baseline.
//!
//! Every field is finite. Ratios whose denominator is zero are reported as 0
//! with the matching `*_undefined` flag set, so "genuinely zero" and "not
//! defined" stay distinguishable.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::ProviderAggregate;
use crate::config::FeatureConfig;
use crate::peers::{PeerTable, safe_ratio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureId {
    TotalPayments,
    TotalServices,
    TotalBeneficiaries,
    MarkupRatio,
    ServicesPerBeneficiary,
    PaymentPerService,
    PaymentPerBeneficiary,
    ZPayment,
    ZServices,
    ZMarkup,
    ZServicesPerBeneficiary,
    CodeConcentration,
    DistinctCodes,
    UpcodingRatio,
    WoundCareShare,
    CovidTestShare,
    PersonalCareShare,
    ServicesPerDay,
    YearsActive,
    MarkupUndefined,
    PerServiceUndefined,
    PerBeneficiaryUndefined,
    UpcodingUndefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Magnitude,
    Ratio,
    PeerZ,
    Share,
    Flag,
}

impl FeatureId {
    pub const ALL: [FeatureId; 23] = [
        FeatureId::TotalPayments,
        FeatureId::TotalServices,
        FeatureId::TotalBeneficiaries,
        FeatureId::MarkupRatio,
        FeatureId::ServicesPerBeneficiary,
        FeatureId::PaymentPerService,
        FeatureId::PaymentPerBeneficiary,
        FeatureId::ZPayment,
        FeatureId::ZServices,
        FeatureId::ZMarkup,
        FeatureId::ZServicesPerBeneficiary,
        FeatureId::CodeConcentration,
        FeatureId::DistinctCodes,
        FeatureId::UpcodingRatio,
        FeatureId::WoundCareShare,
        FeatureId::CovidTestShare,
        FeatureId::PersonalCareShare,
        FeatureId::ServicesPerDay,
        FeatureId::YearsActive,
        FeatureId::MarkupUndefined,
        FeatureId::PerServiceUndefined,
        FeatureId::PerBeneficiaryUndefined,
        FeatureId::UpcodingUndefined,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureId::TotalPayments => "total_payments",
            FeatureId::TotalServices => "total_services",
            FeatureId::TotalBeneficiaries => "total_beneficiaries",
            FeatureId::MarkupRatio => "markup_ratio",
            FeatureId::ServicesPerBeneficiary => "services_per_beneficiary",
            FeatureId::PaymentPerService => "payment_per_service",
            FeatureId::PaymentPerBeneficiary => "payment_per_beneficiary",
            FeatureId::ZPayment => "z_payment",
            FeatureId::ZServices => "z_services",
            FeatureId::ZMarkup => "z_markup",
            FeatureId::ZServicesPerBeneficiary => "z_services_per_beneficiary",
            FeatureId::CodeConcentration => "code_concentration",
            FeatureId::DistinctCodes => "distinct_codes",
            FeatureId::UpcodingRatio => "upcoding_ratio",
            FeatureId::WoundCareShare => "wound_care_share",
            FeatureId::CovidTestShare => "covid_test_share",
            FeatureId::PersonalCareShare => "personal_care_share",
            FeatureId::ServicesPerDay => "services_per_day",
            FeatureId::YearsActive => "years_active",
            FeatureId::MarkupUndefined => "markup_undefined",
            FeatureId::PerServiceUndefined => "per_service_undefined",
            FeatureId::PerBeneficiaryUndefined => "per_beneficiary_undefined",
            FeatureId::UpcodingUndefined => "upcoding_undefined",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.name() == name.trim())
    }

    pub fn label(&self) -> &'static str {
        match self {
            FeatureId::TotalPayments => "Total payments",
            FeatureId::TotalServices => "Total services",
            FeatureId::TotalBeneficiaries => "Total beneficiaries",
            FeatureId::MarkupRatio => "Charges-to-payment markup",
            FeatureId::ServicesPerBeneficiary => "Services per beneficiary",
            FeatureId::PaymentPerService => "Payment per service",
            FeatureId::PaymentPerBeneficiary => "Payment per beneficiary",
            FeatureId::ZPayment => "Payments vs. specialty peers",
            FeatureId::ZServices => "Service volume vs. specialty peers",
            FeatureId::ZMarkup => "Charge markup vs. specialty peers",
            FeatureId::ZServicesPerBeneficiary => "Services per beneficiary vs. specialty peers",
            FeatureId::CodeConcentration => "Billing concentrated in few procedure codes",
            FeatureId::DistinctCodes => "Distinct procedure codes billed",
            FeatureId::UpcodingRatio => "High-intensity visit coding",
            FeatureId::WoundCareShare => "Wound-care and skin-substitute billing share",
            FeatureId::CovidTestShare => "COVID-19 test billing share",
            FeatureId::PersonalCareShare => "Personal-care service billing share",
            FeatureId::ServicesPerDay => "Services per working day",
            FeatureId::YearsActive => "Years with billing activity",
            FeatureId::MarkupUndefined => "Charges billed with no paid amount",
            FeatureId::PerServiceUndefined => "No billed services",
            FeatureId::PerBeneficiaryUndefined => "Services with no recorded beneficiaries",
            FeatureId::UpcodingUndefined => "No evaluation and management visits",
        }
    }

    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureId::TotalPayments
            | FeatureId::TotalServices
            | FeatureId::TotalBeneficiaries
            | FeatureId::DistinctCodes
            | FeatureId::YearsActive => FeatureKind::Magnitude,
            FeatureId::MarkupRatio
            | FeatureId::ServicesPerBeneficiary
            | FeatureId::PaymentPerService
            | FeatureId::PaymentPerBeneficiary
            | FeatureId::ServicesPerDay => FeatureKind::Ratio,
            FeatureId::ZPayment
            | FeatureId::ZServices
            | FeatureId::ZMarkup
            | FeatureId::ZServicesPerBeneficiary => FeatureKind::PeerZ,
            FeatureId::CodeConcentration
            | FeatureId::UpcodingRatio
            | FeatureId::WoundCareShare
            | FeatureId::CovidTestShare
            | FeatureId::PersonalCareShare => FeatureKind::Share,
            FeatureId::MarkupUndefined
            | FeatureId::PerServiceUndefined
            | FeatureId::PerBeneficiaryUndefined
            | FeatureId::UpcodingUndefined => FeatureKind::Flag,
        }
    }

    /// Position in [`FeatureId::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub provider_id: String,
    pub total_payments: f64,
    pub total_services: f64,
    pub total_beneficiaries: f64,
    pub markup_ratio: f64,
    pub services_per_beneficiary: f64,
    pub payment_per_service: f64,
    pub payment_per_beneficiary: f64,
    pub z_payment: f64,
    pub z_services: f64,
    pub z_markup: f64,
    pub z_services_per_beneficiary: f64,
    pub code_concentration: f64,
    pub distinct_codes: f64,
    pub upcoding_ratio: f64,
    pub wound_care_share: f64,
    pub covid_test_share: f64,
    pub personal_care_share: f64,
    pub services_per_day: f64,
    pub years_active: f64,
    pub markup_undefined: bool,
    pub per_service_undefined: bool,
    pub per_beneficiary_undefined: bool,
    pub upcoding_undefined: bool,
}

fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

impl FeatureVector {
    pub fn value(&self, id: FeatureId) -> f64 {
        match id {
            FeatureId::TotalPayments => self.total_payments,
            FeatureId::TotalServices => self.total_services,
            FeatureId::TotalBeneficiaries => self.total_beneficiaries,
            FeatureId::MarkupRatio => self.markup_ratio,
            FeatureId::ServicesPerBeneficiary => self.services_per_beneficiary,
            FeatureId::PaymentPerService => self.payment_per_service,
            FeatureId::PaymentPerBeneficiary => self.payment_per_beneficiary,
            FeatureId::ZPayment => self.z_payment,
            FeatureId::ZServices => self.z_services,
            FeatureId::ZMarkup => self.z_markup,
            FeatureId::ZServicesPerBeneficiary => self.z_services_per_beneficiary,
            FeatureId::CodeConcentration => self.code_concentration,
            FeatureId::DistinctCodes => self.distinct_codes,
            FeatureId::UpcodingRatio => self.upcoding_ratio,
            FeatureId::WoundCareShare => self.wound_care_share,
            FeatureId::CovidTestShare => self.covid_test_share,
            FeatureId::PersonalCareShare => self.personal_care_share,
            FeatureId::ServicesPerDay => self.services_per_day,
            FeatureId::YearsActive => self.years_active,
            FeatureId::MarkupUndefined => flag(self.markup_undefined),
            FeatureId::PerServiceUndefined => flag(self.per_service_undefined),
            FeatureId::PerBeneficiaryUndefined => flag(self.per_beneficiary_undefined),
            FeatureId::UpcodingUndefined => flag(self.upcoding_undefined),
        }
    }

    pub fn row(&self, ids: &[FeatureId]) -> Vec<f64> {
        ids.iter().map(|id| self.value(*id)).collect()
    }
}

/// Evaluation and management families, levels ordered from least to most intensive.
const VISIT_FAMILIES: &[&[&str]] = &[
    &["99201", "99202", "99203", "99204", "99205"],
    &["99211", "99212", "99213", "99214", "99215"],
    &["99281", "99282", "99283", "99284", "99285"],
    &["99221", "99222", "99223"],
    &["99231", "99232", "99233"],
];

/// `Some(true)` for the upper half of a family's levels, `None` outside every family.
fn visit_intensity(code: &str) -> Option<bool> {
    VISIT_FAMILIES.iter().find_map(|levels| {
        levels
            .iter()
            .position(|level| *level == code)
            .map(|idx| idx >= levels.len().div_ceil(2))
    })
}

fn cpt_number(code: &str) -> Option<u32> {
    if code.len() == 5 && code.bytes().all(|b| b.is_ascii_digit()) {
        code.parse().ok()
    } else {
        None
    }
}

fn level_two_number(code: &str, prefix: u8) -> Option<u32> {
    let bytes = code.as_bytes();
    if bytes.len() == 5 && bytes[0] == prefix && bytes[1..].iter().all(u8::is_ascii_digit) {
        code[1..].parse().ok()
    } else {
        None
    }
}

fn is_wound_care(code: &str) -> bool {
    level_two_number(code, b'Q').is_some_and(|n| (4100..=4399).contains(&n))
        || cpt_number(code).is_some_and(|n| matches!(n, 11042..=11047 | 97597 | 97598 | 97602))
}

fn is_covid_test(code: &str) -> bool {
    level_two_number(code, b'U').is_some_and(|n| (1..=5).contains(&n))
        || matches!(code, "87426" | "87635" | "87811" | "0240U" | "0241U")
}

fn is_personal_care(code: &str) -> bool {
    matches!(code, "T1019" | "T1020" | "S5125" | "S5130")
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CodeMix {
    hhi: f64,
    distinct: u64,
    visit_services: u64,
    high_visit_services: u64,
    wound_care: u64,
    covid_test: u64,
    personal_care: u64,
}

fn code_mix(agg: &ProviderAggregate) -> CodeMix {
    let total = agg.total_services as f64;
    let mut mix = CodeMix::default();
    for (code, &services) in &agg.code_services {
        if services == 0 {
            continue;
        }
        mix.distinct += 1;
        if total > 0.0 {
            let share = services as f64 / total;
            mix.hhi += share * share;
        }
        if let Some(high) = visit_intensity(code) {
            mix.visit_services += services;
            if high {
                mix.high_visit_services += services;
            }
        }
        if is_wound_care(code) {
            mix.wound_care += services;
        }
        if is_covid_test(code) {
            mix.covid_test += services;
        }
        if is_personal_care(code) {
            mix.personal_care += services;
        }
    }
    mix
}

/// Pure: the same aggregate and peer table always give the same vector.
pub fn build_feature_vector(
    agg: &ProviderAggregate,
    peers: &PeerTable,
    cfg: &FeatureConfig,
) -> FeatureVector {
    let payments = agg.total_payments();
    let services = agg.total_services as f64;
    let beneficiaries = agg.total_beneficiaries as f64;

    let (markup_ratio, markup_undefined) = safe_ratio(agg.total_charges(), payments);
    let (services_per_beneficiary, per_beneficiary_undefined) = safe_ratio(services, beneficiaries);
    let (payment_per_beneficiary, _) = safe_ratio(payments, beneficiaries);
    let (payment_per_service, per_service_undefined) = safe_ratio(payments, services);

    let mix = code_mix(agg);
    let (upcoding_ratio, upcoding_undefined) =
        safe_ratio(mix.high_visit_services as f64, mix.visit_services as f64);
    let (wound_care_share, _) = safe_ratio(mix.wound_care as f64, services);
    let (covid_test_share, _) = safe_ratio(mix.covid_test as f64, services);
    let (personal_care_share, _) = safe_ratio(mix.personal_care as f64, services);

    let (annual_services, _) = safe_ratio(services, f64::from(agg.years_active));
    let (services_per_day, _) = safe_ratio(annual_services, cfg.working_days_per_year);

    let z = peers.z_scores(agg);

    FeatureVector {
        provider_id: agg.provider_id.clone(),
        total_payments: payments,
        total_services: services,
        total_beneficiaries: beneficiaries,
        markup_ratio,
        services_per_beneficiary,
        payment_per_service,
        payment_per_beneficiary,
        z_payment: finite_or_zero(z.z_payment),
        z_services: finite_or_zero(z.z_services),
        z_markup: finite_or_zero(z.z_markup),
        z_services_per_beneficiary: finite_or_zero(z.z_services_per_beneficiary),
        code_concentration: mix.hhi,
        distinct_codes: mix.distinct as f64,
        upcoding_ratio,
        wound_care_share,
        covid_test_share,
        personal_care_share,
        services_per_day,
        years_active: f64::from(agg.years_active),
        markup_undefined,
        per_service_undefined,
        per_beneficiary_undefined,
        upcoding_undefined,
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// Builds vectors in parallel; output order follows `aggregates`.
pub fn build_feature_vectors(
    aggregates: &[ProviderAggregate],
    peers: &PeerTable,
    cfg: &FeatureConfig,
) -> Vec<FeatureVector> {
    aggregates
        .par_iter()
        .map(|agg| build_feature_vector(agg, peers, cfg))
        .collect()
}
