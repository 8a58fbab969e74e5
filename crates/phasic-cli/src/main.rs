//! Phasic CLI
//!
//! Runs the two-phase optimizer on synthetic rollouts and inspects configuration.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use phasic::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod rollout;

#[derive(Parser)]
#[command(name = "phasic")]
#[command(version, about = "Phasic - two-phase policy optimization in Rust", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train an MLP policy on synthetic contextual-bandit rollouts
    Train {
        /// Optimizer config (JSON); flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Outer iterations (rollout + two-phase update)
        #[arg(long, default_value = "5")]
        iterations: usize,

        /// Rows per rollout
        #[arg(long, default_value = "256")]
        batch_size: i64,

        /// Observation features
        #[arg(long, default_value = "8")]
        obs_size: i64,

        /// Number of discrete actions
        #[arg(long, default_value = "4")]
        num_actions: i64,

        /// Learning rate of both optimizers
        #[arg(long, default_value = "0.0003")]
        lr: f64,

        #[arg(long)]
        num_sgd_iter: Option<usize>,

        #[arg(long)]
        sgd_minibatch_size: Option<usize>,

        #[arg(long)]
        aux_epochs: Option<usize>,

        #[arg(long)]
        aux_minibatch_size: Option<usize>,

        #[arg(long)]
        num_env_slots: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the optimizer configuration as JSON
    Config {
        /// Config file to load instead of the defaults
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Sizes of one train run that the command line may override
struct Overrides {
    num_sgd_iter: Option<usize>,
    sgd_minibatch_size: Option<usize>,
    aux_epochs: Option<usize>,
    aux_minibatch_size: Option<usize>,
    num_env_slots: Option<usize>,
    seed: Option<u64>,
}

fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            iterations,
            batch_size,
            obs_size,
            num_actions,
            lr,
            num_sgd_iter,
            sgd_minibatch_size,
            aux_epochs,
            aux_minibatch_size,
            num_env_slots,
            seed,
        } => {
            let overrides = Overrides {
                num_sgd_iter,
                sgd_minibatch_size,
                aux_epochs,
                aux_minibatch_size,
                num_env_slots,
                seed,
            };
            let sgd_config = train_config(config.as_deref(), overrides)?;
            train(sgd_config, iterations, batch_size, obs_size, num_actions, lr)?;
        }
        Commands::Config { config } => {
            let sgd_config = match config {
                Some(path) => SgdConfig::from_json_file(path)?,
                None => SgdConfig::default(),
            };
            println!("{}", serde_json::to_string_pretty(&sgd_config)?);
        }
    }

    Ok(())
}

/// Demo-sized defaults, or the file's values, with command-line overrides applied
fn train_config(path: Option<&Path>, overrides: Overrides) -> Result<SgdConfig> {
    let mut config = match path {
        Some(path) => SgdConfig::from_json_file(path)?,
        None => SgdConfig::default()
            .with_sgd_minibatch_size(64)
            .with_num_env_slots(64)
            .with_aux_minibatch_size(64)
            .with_aux_epochs(2),
    };

    if let Some(v) = overrides.num_sgd_iter {
        config.num_sgd_iter = v;
    }
    if let Some(v) = overrides.sgd_minibatch_size {
        config.sgd_minibatch_size = v;
    }
    if let Some(v) = overrides.aux_epochs {
        config.aux_epochs = v;
    }
    if let Some(v) = overrides.aux_minibatch_size {
        config.aux_minibatch_size = v;
    }
    if let Some(v) = overrides.num_env_slots {
        config.num_env_slots = v;
    }
    if let Some(v) = overrides.seed {
        config.seed = v;
    }
    config.validate()?;
    Ok(config)
}

fn train(
    config: SgdConfig,
    iterations: usize,
    batch_size: i64,
    obs_size: i64,
    num_actions: i64,
    lr: f64,
) -> Result<()> {
    if batch_size <= 0 {
        bail!("batch size must be positive");
    }
    if num_actions <= 0 || obs_size < num_actions {
        bail!(
            "need 0 < num_actions <= obs_size, got {} actions and {} features",
            num_actions,
            obs_size
        );
    }
    let segment_rows = smallest_minibatch(batch_size as usize, config.sgd_minibatch_size);
    if segment_rows < config.num_env_slots {
        bail!(
            "minibatches of {} rows are smaller than num_env_slots ({})",
            segment_rows,
            config.num_env_slots
        );
    }

    let device = if tch::Cuda::is_available() {
        tracing::info!("Using CUDA");
        tch::Device::Cuda(0)
    } else {
        tracing::info!("Using CPU");
        tch::Device::Cpu
    };
    tch::manual_seed(config.seed as i64);

    tracing::info!(
        iterations,
        batch_size,
        obs_size,
        num_actions,
        lr,
        "Starting training"
    );

    let policy_config = MlpAuxConfig {
        learning_rate: lr,
        aux_learning_rate: lr,
        ..Default::default()
    };
    let policy = MlpAuxPolicy::new(
        obs_size,
        num_actions,
        DistKind::Categorical,
        policy_config,
        device,
    )?;
    tracing::info!(params = policy.num_parameters(), "Created MLP policy");

    let mut policies = BTreeMap::from([(DEFAULT_POLICY_ID.to_string(), policy)]);
    let mut learner = PpoLearner::default();
    let mut optimizer = PhasicOptimizer::new(config.with_device(device))?;

    let pb = ProgressBar::new(iterations as u64);
    let template = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";
    pb.set_style(ProgressStyle::default_bar().template(template)?.progress_chars("#>-"));

    let mut fetches = Fetches::new();
    for _ in 0..iterations {
        let (batch, mean_reward) = rollout::collect(
            &policies[DEFAULT_POLICY_ID],
            batch_size,
            obs_size,
            num_actions,
        )?;
        fetches = optimizer.do_minibatch_sgd(batch, &mut policies, &mut learner)?;
        pb.set_message(format!("reward {:.3}", mean_reward));
        pb.inc(1);
    }
    pb.finish_with_message("done");

    println!("{}", serde_json::to_string_pretty(&fetches)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_overrides() -> Overrides {
        Overrides {
            num_sgd_iter: None,
            sgd_minibatch_size: None,
            aux_epochs: None,
            aux_minibatch_size: None,
            num_env_slots: None,
            seed: None,
        }
    }

    #[test]
    fn test_overrides_applied() {
        let overrides = Overrides {
            aux_epochs: Some(1),
            num_env_slots: Some(16),
            ..no_overrides()
        };
        let config = train_config(None, overrides).unwrap();
        assert_eq!(config.aux_epochs, 1);
        assert_eq!(config.num_env_slots, 16);
        assert_eq!(config.sgd_minibatch_size, 64);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let overrides = Overrides {
            aux_minibatch_size: Some(0),
            ..no_overrides()
        };
        assert!(train_config(None, overrides).is_err());
    }
}
