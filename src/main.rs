use anyhow::{Context, Result};
use clap::Parser;

use themec::app::{Cli, run};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("CLI: Failed to initialize thread pool")?;
    }

    let start = std::time::Instant::now();
    let summary = run(&cli)?;
    tracing::info!(
        "Done! {} layers and {} themes in {:.2}s",
        summary.layers_compiled,
        summary.themes_compiled,
        start.elapsed().as_secs_f64()
    );

    if summary.failures() > 0 {
        anyhow::bail!(
            "{} layers and {} themes failed to compile",
            summary.layers_failed,
            summary.themes_failed
        );
    }
    Ok(())
}
