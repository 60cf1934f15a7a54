//! Loading the billing extract and the two confirmed-fraud identifier lists.
//!
//! Billing sources go through DuckDB with every column cast to text, so a
//! malformed value reaches the rejection tally instead of failing the read.

use std::path::{Path, PathBuf};

use duckdb::Connection;
use serde::de::DeserializeOwned;

use crate::common::{quote_ident, source_expr};
use crate::error::IngestError;
use crate::labels::{ExclusionEntry, ProsecutionEntry};
use crate::records::{BillingLineRecord, IngestTally, RawBillingRow};

/// Canonical billing columns and the source headers accepted for each, compared case-insensitively.
const BILLING_COLUMNS: [(&str, &[&str], bool); 11] = [
    ("provider_id", &["provider_id", "npi", "rndrng_npi", "billing_provider_npi_num"], true),
    ("year", &["year", "service_year"], true),
    ("procedure_code", &["procedure_code", "hcpcs_code", "hcpcs_cd"], true),
    ("service_count", &["service_count", "tot_srvcs", "total_claims"], true),
    ("beneficiary_count", &["beneficiary_count", "tot_benes", "total_unique_beneficiaries"], true),
    ("submitted_charge_total", &["submitted_charge_total", "tot_sbmtd_chrg"], true),
    ("allowed_amount_total", &["allowed_amount_total", "tot_alowd_amt"], true),
    ("paid_amount_total", &["paid_amount_total", "tot_pymt_amt", "total_paid"], true),
    ("specialty", &["specialty", "provider_type", "rndrng_prvdr_type"], true),
    ("state", &["state", "rndrng_prvdr_state_abrvtn"], true),
    ("entity_type", &["entity_type", "rndrng_prvdr_ent_cd"], false),
];

/// Source column for each canonical column, in `BILLING_COLUMNS` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub sources: Vec<Option<String>>,
}

pub fn resolve_columns(path: &Path, available: &[String]) -> Result<ColumnMap, IngestError> {
    let mut sources = Vec::with_capacity(BILLING_COLUMNS.len());
    for (canonical, accepted, required) in BILLING_COLUMNS {
        let found = accepted.iter().find_map(|alias| {
            available
                .iter()
                .find(|name| name.trim().eq_ignore_ascii_case(alias))
                .cloned()
        });
        if found.is_none() && required {
            return Err(IngestError::MissingColumn {
                path: path.display().to_string(),
                column: canonical,
            });
        }
        sources.push(found);
    }
    Ok(ColumnMap { sources })
}

impl ColumnMap {
    fn select_list(&self) -> String {
        self.sources
            .iter()
            .zip(BILLING_COLUMNS)
            .map(|(source, (canonical, _, _))| match source {
                Some(name) => format!("CAST({} AS VARCHAR) AS {canonical}", quote_ident(name)),
                None => format!("CAST(NULL AS VARCHAR) AS {canonical}"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn source_error(path: &Path, err: impl std::fmt::Display) -> IngestError {
    IngestError::Source {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

fn load_column_names(
    conn: &Connection,
    path: &Path,
    source: &str,
) -> Result<Vec<String>, IngestError> {
    let query = format!("DESCRIBE SELECT * FROM {source}");
    let mut stmt = conn.prepare(&query).map_err(|err| source_error(path, err))?;
    let rows = stmt
        .query_map([], |row| row.get::<usize, String>(0))
        .map_err(|err| source_error(path, err))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row.map_err(|err| source_error(path, err))?);
    }
    Ok(names)
}

/// Parses every row of every source into `tally`, returning the accepted records.
///
/// Row numbers in the tally run on across sources.
pub fn read_billing_sources(
    paths: &[PathBuf],
    tally: &mut IngestTally,
) -> Result<Vec<BillingLineRecord>, IngestError> {
    let conn =
        Connection::open_in_memory().map_err(|err| source_error(Path::new(":memory:"), err))?;
    let mut records = Vec::new();

    for path in paths {
        let source = source_expr(path)?;
        let columns = load_column_names(&conn, path, &source)?;
        let map = resolve_columns(path, &columns)?;
        let query = format!("SELECT {} FROM {source}", map.select_list());

        let mut stmt = conn.prepare(&query).map_err(|err| source_error(path, err))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawBillingRow {
                    provider_id: row.get(0)?,
                    year: row.get(1)?,
                    procedure_code: row.get(2)?,
                    service_count: row.get(3)?,
                    beneficiary_count: row.get(4)?,
                    submitted_charge_total: row.get(5)?,
                    allowed_amount_total: row.get(6)?,
                    paid_amount_total: row.get(7)?,
                    specialty: row.get(8)?,
                    state: row.get(9)?,
                    entity_type: row.get(10)?,
                })
            })
            .map_err(|err| source_error(path, err))?;

        let before = tally.rows_read;
        for row in rows {
            let raw = row.map_err(|err| source_error(path, err))?;
            let row_number = tally.rows_read + 1;
            if let Some(record) = tally.observe(row_number, raw.parse()) {
                records.push(record);
            }
        }
        tracing::info!(
            path = %path.display(),
            rows = tally.rows_read - before,
            "read billing source"
        );
    }

    Ok(records)
}

/// Reads the billing extract and enforces the rejection ceiling.
pub fn load_billing(
    paths: &[PathBuf],
    max_rejection_rate: f64,
) -> Result<(Vec<BillingLineRecord>, IngestTally), IngestError> {
    let mut tally = IngestTally::default();
    let records = read_billing_sources(paths, &mut tally)?;
    if tally.rows_rejected > 0 {
        tracing::warn!(
            rejected = tally.rows_rejected,
            total = tally.rows_read,
            rate = tally.rejection_rate(),
            "rejected malformed billing rows"
        );
    }
    tally.check_ceiling(max_rejection_rate)?;
    Ok((records, tally))
}

fn read_csv_entries<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|err| source_error(path, err))?;
    let mut entries = Vec::new();
    for (idx, entry) in reader.deserialize::<T>().enumerate() {
        entries.push(entry.map_err(|err| IngestError::Source {
            path: path.display().to_string(),
            message: format!("row {}: {err}", idx + 1),
        })?);
    }
    Ok(entries)
}

pub fn read_exclusions(path: &Path) -> Result<Vec<ExclusionEntry>, IngestError> {
    let entries = read_csv_entries(path)?;
    tracing::info!(path = %path.display(), entries = entries.len(), "read exclusion registry");
    Ok(entries)
}

pub fn read_prosecutions(path: &Path) -> Result<Vec<ProsecutionEntry>, IngestError> {
    let entries = read_csv_entries(path)?;
    tracing::info!(path = %path.display(), entries = entries.len(), "read prosecution list");
    Ok(entries)
}
