use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "provider_risk")]
#[command(about = "Score providers for fraud risk from billing history and confirmed-fraud lists", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Aggregate billing, train the classifier, score every provider and write artifacts.
    Run(RunArgs),
    /// Re-partition an existing scored set under a new threshold without rescoring.
    Rethreshold(RethresholdArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Pipeline configuration (TOML). See config/pipeline.toml.
    #[arg(long)]
    pub config: PathBuf,

    /// Billing extract (.csv or .parquet). Repeat the flag or pass a glob such as `billing/*.parquet`.
    #[arg(long, required = true, num_args = 1..)]
    pub billing: Vec<PathBuf>,

    /// Exclusion registry CSV (identifier/NPI, exclusion_date/EXCLDATE, reason_code/EXCLTYPE).
    #[arg(long)]
    pub exclusions: PathBuf,

    /// Prosecution list CSV (identifier, case_reference).
    #[arg(long)]
    pub prosecutions: PathBuf,

    /// Directory receiving the artifacts.
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Overrides `run.seed`.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Overrides `run.threshold`.
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Hide progress bars.
    #[arg(long)]
    pub quiet: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RethresholdArgs {
    /// scored_providers.csv from a previous run.
    #[arg(long)]
    pub scored: PathBuf,

    /// model_diagnostics.json from the same run.
    #[arg(long)]
    pub diagnostics: PathBuf,

    /// New publication threshold in [0, 1].
    #[arg(long)]
    pub threshold: f64,

    /// Directory receiving flagged_providers.json and model_diagnostics.json.
    #[arg(long)]
    pub output_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_repeated_billing_paths() {
        let args = Args::try_parse_from([
            "provider_risk",
            "run",
            "--config",
            "config/pipeline.toml",
            "--billing",
            "a.csv",
            "b.parquet",
            "--exclusions",
            "leie.csv",
            "--prosecutions",
            "doj.csv",
            "--output-dir",
            "out",
            "--seed",
            "9",
        ])
        .unwrap();
        let Command::Run(run) = args.cmd else {
            panic!("expected run");
        };
        assert_eq!(run.billing.len(), 2);
        assert_eq!(run.seed, Some(9));
        assert_eq!(run.threshold, None);
        assert!(!run.quiet);
    }

    #[test]
    fn rethreshold_requires_threshold() {
        assert!(
            Args::try_parse_from([
                "provider_risk",
                "rethreshold",
                "--scored",
                "s.csv",
                "--diagnostics",
                "d.json",
                "--output-dir",
                "out",
            ])
            .is_err()
        );
    }
}
