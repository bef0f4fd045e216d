//! privaudit CLI - Membership inference privacy auditing.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use privaudit::models::EXAMPLE_CONFIG;
use privaudit::{AuditPipeline, Config};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "privaudit")]
#[command(version)]
#[command(about = "Membership inference privacy auditing of trained model pools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the model pool (or reuse checkpoints) and audit the targets
    Run {
        /// Number of target models to audit
        #[arg(short, long)]
        experiments: Option<usize>,

        /// Hide per-device progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            println!("{EXAMPLE_CONFIG}");
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            config.validate().context("Invalid configuration")?;

            info!("Configuration is valid");
            info!(
                "  Pool: {} models, {} targets",
                config.pool_size(),
                config.run.num_experiments
            );
            info!(
                "  Attack: {:?} with {} reference models",
                config.audit.algorithm, config.audit.num_ref_models
            );
            info!("  Devices: {}", config.train.devices.join(", "));
            if config.ramia.enabled {
                info!(
                    "  Range audit: {} neighbours per sample",
                    config.ramia.sample_size
                );
            }
        }

        Commands::Run {
            experiments,
            no_progress,
        } => {
            let mut config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            // Override from CLI
            if let Some(n) = experiments {
                config.run.num_experiments = n;
            }
            if no_progress {
                config.run.show_progress = false;
            }

            let pipeline = AuditPipeline::new(config).context("Invalid configuration")?;
            let run = pipeline.run().await.context("Audit failed")?;

            println!("\n=== Privacy Audit Complete ===");
            println!("Models:      {} trained, {} loaded", run.models_trained, run.models_loaded);
            for audit in &run.audits {
                println!(
                    "Target {:>3}: AUC {:.4}  TPR@0.1%FPR {:.4}  TPR@0%FPR {:.4}",
                    audit.target,
                    audit.metrics.auc,
                    audit.metrics.tpr_at_low_fpr,
                    audit.metrics.tpr_at_zero_fpr
                );
            }
            if let Some(summary) = &run.summary {
                println!(
                    "Mean AUC:    {:.4} ± {:.4} over {} targets",
                    summary.auc.mean, summary.auc.std, summary.experiments
                );
            }
            println!("Runtime:     {:.1}s", run.runtime_secs);
            println!("Report:      {:?}", run.run_dir);
        }
    }

    Ok(())
}
