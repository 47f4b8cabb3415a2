mod config;
mod executor;
mod run_cmd;
mod validate_cmd;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use pivot_core::config::EngineConfig;
use pivot_core::orchestrator::ExportFormat;

use config::CliOverrides;
use run_cmd::RunOptions;

#[derive(Parser)]
#[command(name = "pivot", about = "Adaptive task planning and replanning engine")]
struct Cli {
    /// Engine config file (overrides ~/.config/pivot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default engine config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Check a plan file and print its execution order
    Validate {
        /// Path to the plan TOML file
        file: PathBuf,
    },
    /// Execute a plan file, running each task's `command` through `sh -c`
    Run {
        /// Path to the plan TOML file
        file: PathBuf,
        /// Maximum number of tasks per wave
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Run tasks one at a time in plan order
        #[arg(long)]
        sequential: bool,
        /// Retry failed tasks automatically
        #[arg(long)]
        auto_replan: bool,
        /// Report format: markdown or json
        #[arg(long, default_value = "markdown")]
        format: ExportFormat,
        /// Write the report to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Execute the `pivot init` command: write the default config file.
fn cmd_init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = EngineConfig::default();
    config::save_config(path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("  scheduler.max_parallel = {}", cfg.scheduler.max_parallel);
    println!("  monitor.failure_threshold = {}", cfg.monitor.failure_threshold);
    println!("  replan.auto_replan = {}", cfg.replan.auto_replan);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let path = cli.config.unwrap_or_else(config::config_path);
            cmd_init(&path, force)?;
        }
        Commands::Validate { file } => {
            validate_cmd::run_validate(&file)?;
        }
        Commands::Run {
            file,
            max_parallel,
            sequential,
            auto_replan,
            format,
            output,
        } => {
            let engine_config = config::resolve(&CliOverrides {
                config_file: cli.config,
                max_parallel,
                sequential,
                auto_replan,
            })?;
            let options = RunOptions {
                plan_file: file,
                format,
                output,
            };
            run_cmd::run_plan(engine_config, &options).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that read or write process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
