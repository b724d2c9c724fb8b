//! Command-line surface: a single `run` subcommand.

use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use provisioner_proto::Config;

/// the provisioning orchestrator
#[derive(Debug, FromArgs)]
pub struct Args {
    #[argh(subcommand)]
    cmd: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
}

/// run the provisioning orchestrator until shutdown
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// path to the orchestrator's own YAML or JSON config file
    #[argh(option)]
    config: PathBuf,

    /// path to the Choria client config used to reach the fabric. Only its
    /// presence is validated here; connection details are the fabric
    /// client's concern.
    #[argh(option)]
    choria_config: PathBuf,

    /// path to write this process's pid to
    #[argh(option)]
    pid: Option<PathBuf>,
}

impl Args {
    pub fn run(self) -> anyhow::Result<()> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;
        match self.cmd {
            Command::Run(args) => rt.block_on(run(args)),
        }
    }
}

async fn run(args: RunCommand) -> anyhow::Result<()> {
    if !args.choria_config.exists() {
        anyhow::bail!(
            "choria config {} does not exist",
            args.choria_config.display()
        );
    }

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    if let Some(pid_path) = &args.pid {
        std::fs::write(pid_path, std::process::id().to_string())
            .with_context(|| format!("failed to write pid file {}", pid_path.display()))?;
    }

    // The fabric connection URL isn't part of our own Config schema - it
    // comes from the Choria client config, whose format is out of scope.
    // Orchestrator wiring assumes the default local NATS endpoint unless
    // overridden by the environment, matching how Choria clients resolve a
    // broker in the absence of an explicit override.
    let nats_url = std::env::var("CHORIA_NATS_URL")
        .unwrap_or_else(|_| "nats://127.0.0.1:4222".to_owned());

    crate::orchestrator::run(config, &nats_url).await
}
