pub const FEATURE_SCHEMA_VERSION: &str = "fv-2";

pub const DEFAULT_MAX_REJECTION_RATE: f64 = 0.01;
pub const DEFAULT_MIN_PEER_COUNT: usize = 30;
pub const DEFAULT_STD_FLOOR: f64 = 1e-6;
pub const DEFAULT_WORKING_DAYS_PER_YEAR: f64 = 250.0;

pub const DEFAULT_FOLDS: usize = 5;
pub const DEFAULT_TREES: usize = 200;
pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_MIN_SAMPLES_LEAF: usize = 5;

pub const DEFAULT_TOP_RISK_FACTORS: usize = 3;

pub const MIN_BILLING_YEAR: u16 = 1990;
pub const MAX_BILLING_YEAR: u16 = 2100;

/// Largest accepted per-row count. Rows above it are rejected, which keeps
/// per-provider sums far from `u64` overflow.
pub const MAX_ROW_COUNT: u64 = 1_000_000_000_000;
/// Largest accepted per-row amount: $100 billion, in cents.
pub const MAX_ROW_AMOUNT_CENTS: u64 = 10_000_000_000_000;

/// Providers stop appearing in billing data once excluded, so activity span can
/// track the label rather than behavior.
pub const LEAKAGE_RISK_FEATURES: &[&str] = &["years_active"];

pub const FLAGGED_PROVIDERS_FILE: &str = "flagged_providers.json";
pub const MODEL_DIAGNOSTICS_FILE: &str = "model_diagnostics.json";
pub const SCORED_PROVIDERS_CSV: &str = "scored_providers.csv";
pub const SCORED_PROVIDERS_PARQUET: &str = "scored_providers.parquet";
pub const MODEL_FILE: &str = "model.json";
