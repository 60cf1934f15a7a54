use anyhow::Context;
use clap::Parser;

use provider_risk::args::{Args, Command};
use provider_risk::config::{Overrides, PipelineConfig};
use provider_risk::pipeline::{self, RunInputs};

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    match args.cmd {
        Command::Run(cmd) => {
            let overrides = Overrides {
                seed: cmd.seed,
                threshold: cmd.threshold,
            };
            let cfg = PipelineConfig::load(&cmd.config, &overrides)
                .with_context(|| format!("invalid configuration {}", cmd.config.display()))?;
            let inputs = RunInputs {
                billing: cmd.billing,
                exclusions: cmd.exclusions,
                prosecutions: cmd.prosecutions,
                output_dir: cmd.output_dir,
            };
            let paths = pipeline::run(&cfg, &inputs, cmd.quiet).context("run failed")?;
            tracing::info!(flagged = %paths.flagged.display(), "run complete");
        }
        Command::Rethreshold(cmd) => {
            let paths = pipeline::rethreshold(
                &cmd.scored,
                &cmd.diagnostics,
                cmd.threshold,
                &cmd.output_dir,
            )
            .context("rethreshold failed")?;
            tracing::info!(flagged = %paths.flagged.display(), "rethreshold complete");
        }
    }
    Ok(())
}
