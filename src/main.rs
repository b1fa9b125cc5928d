//! cloud-init-engine - staged instance configuration
//!
//! One invocation per boot stage: `init --local`, `init`,
//! `modules --mode config` and `modules --mode final`. The exit code is 1
//! when the stage recorded any error.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cloud_init_engine::{
    config::{self, fetch_base_config},
    stages::{self, ModulesMode, StageOptions},
    state::{CloudPaths, Frequency, InstanceState},
};

#[derive(Parser)]
#[command(name = "cloud-init-engine")]
#[command(author, version, about = "Staged instance configuration", long_about = None)]
struct Cli {
    /// Enable verbose output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Persistent state directory
    #[arg(long, env = "CLOUD_INIT_CLOUD_DIR", global = true)]
    cloud_dir: Option<PathBuf>,

    /// Directory holding cloud.cfg and cloud.cfg.d
    #[arg(long, env = "CLOUD_INIT_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Per-boot runtime directory
    #[arg(long, env = "CLOUD_INIT_RUN_DIR", global = true)]
    run_dir: Option<PathBuf>,

    /// Root of the system being configured; state directories move with it
    #[arg(long, env = "CLOUD_INIT_ROOT", global = true)]
    root: Option<PathBuf>,

    /// Additional YAML configuration files to merge in
    #[arg(long = "file", short = 'f', global = true)]
    files: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the datasource, consume user-data and run the init modules
    Init {
        /// Run the pre-network stage
        #[arg(long)]
        local: bool,
        /// Continue without a datasource
        #[arg(long)]
        force: bool,
    },
    /// Run one module section
    Modules {
        #[arg(long, value_enum, default_value = "config")]
        mode: Mode,
        #[arg(long)]
        force: bool,
    },
    /// Run a single module
    Single {
        /// Module name, e.g. write_files
        #[arg(long)]
        name: String,
        /// Override the module frequency (always, once, once-per-instance)
        #[arg(long)]
        frequency: Option<Frequency>,
        #[arg(long)]
        force: bool,
        /// Arguments passed to the module
        args: Vec<String>,
    },
    /// Show the status of the boot stages
    Status,
    /// Remove instance state so the next boot starts fresh
    Clean {
        /// Remove logs as well
        #[arg(long)]
        logs: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Init,
    Config,
    Final,
}

impl From<Mode> for ModulesMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Init => ModulesMode::Init,
            Mode::Config => ModulesMode::Config,
            Mode::Final => ModulesMode::Final,
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
    {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Defaults, then `system_info.paths` from config, then command line flags
async fn resolve_paths(cli: &Cli) -> anyhow::Result<CloudPaths> {
    let mut paths = match &cli.root {
        Some(root) => CloudPaths::with_root(root),
        None => CloudPaths::new(),
    };
    if let Some(dir) = &cli.config_dir {
        paths.config_dir = dir.clone();
    }

    let cfg = fetch_base_config(&paths)
        .await
        .context("loading system configuration")?;
    let mut paths = paths.with_overrides(
        config::get_str(&cfg, "system_info.paths.cloud_dir"),
        config::get_str(&cfg, "system_info.paths.run_dir"),
    );

    if let Some(dir) = &cli.cloud_dir {
        paths.cloud_dir = dir.clone();
    }
    if let Some(dir) = &cli.run_dir {
        paths.run_dir = dir.clone();
    }
    Ok(paths)
}

async fn run(cli: Cli) -> anyhow::Result<usize> {
    let paths = resolve_paths(&cli).await?;
    let mut opts = StageOptions {
        files: cli.files.clone(),
        ..Default::default()
    };

    match cli.command {
        Commands::Init { local, force } => {
            opts.force = force;
            let stage = if local { "init-local" } else { "init" };
            info!("Running {} stage", stage);
            let errors = stages::status_wrapper(
                &paths,
                stage,
                stages::main_init(&paths, local, &opts),
            )
            .await?;
            Ok(errors)
        }
        Commands::Modules { mode, force } => {
            opts.force = force;
            let mode = ModulesMode::from(mode);
            info!("Running modules for {}", mode);
            let errors = stages::status_wrapper(
                &paths,
                &mode.stage_name(),
                stages::main_modules(&paths, mode, &opts),
            )
            .await?;
            Ok(errors)
        }
        Commands::Single {
            name,
            frequency,
            force,
            args,
        } => {
            opts.force = force;
            let errors = stages::main_single(&paths, &name, frequency, args, &opts).await?;
            for e in &errors {
                error!("{}", e);
            }
            Ok(errors.len())
        }
        Commands::Status => {
            let status = InstanceState::new(paths).read_status().await?;
            println!("status: {}", status.summary());
            if let Some(ds) = &status.datasource {
                println!("datasource: {}", ds);
            }
            for (stage, entry) in &status.stages {
                let state = if entry.finished.is_some() {
                    "finished"
                } else {
                    "running"
                };
                println!("  {}: {} ({} errors)", stage, state, entry.errors.len());
            }
            let errors = status.errors();
            for e in &errors {
                println!("error: {}", e);
            }
            Ok(errors.len())
        }
        Commands::Clean { logs } => {
            InstanceState::new(paths).clean(logs).await?;
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(count) => {
            error!("{} errors reported", count);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
