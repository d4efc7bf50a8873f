mod config;
mod control;
mod errors;
mod logging;
mod lrpm_paths;
mod supervisor;
mod workers;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{SupervisorSettings, YamlFileSource};
use control::server::ControlServer;
use std::path::PathBuf;
use supervisor::clock::SystemClock;
use supervisor::manager::ProcessManager;
use supervisor::process::OsBackend;
use workers::WorkerRegistry;

/// Git commit the binary was built from.
pub const BUILD_SHA: &str = env!("LRPM_GIT_SHA");

#[derive(Parser)]
#[command(name = "lrpm")]
#[command(about = "Lightweight supervisor for long-running worker processes")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor against a job file
    Run {
        /// YAML or JSON file with a top-level `jobs:` mapping
        config: PathBuf,
    },
    /// Send a control command to a running supervisor
    Ctl {
        /// Command words, e.g. `status` or `restart 3`
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(config),
        Command::Ctl { command } => {
            let response =
                control::client::send_command(&lrpm_paths::control_socket_path(), &command.join(" "))?;
            println!("{}", response);
            Ok(())
        }
    }
}

fn run(config_path: PathBuf) -> Result<()> {
    logging::init_tracing();

    let settings = SupervisorSettings::from_env();
    let workers = WorkerRegistry::with_builtins();
    let source = YamlFileSource::new(&config_path).with_worker_types(workers.names());
    let control = ControlServer::bind(&lrpm_paths::control_socket_path())
        .context("Failed to start control socket")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        build = BUILD_SHA,
        config = %config_path.display(),
        socket = %control.socket_path().display(),
        "starting lrpm"
    );

    let mut manager = ProcessManager::new(
        OsBackend::new(workers),
        Box::new(source),
        settings,
        Box::new(SystemClock),
    )
    .with_control(control);
    manager.run()
}
