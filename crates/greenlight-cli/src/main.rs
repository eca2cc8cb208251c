//! Greenlight CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use greenlight_config::{ClusterBackend, ExecutorBackend};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "greenlight")]
#[command(about = "Provision a stack and drive its delivery lanes", long_about = None)]
struct Cli {
    /// Runtime settings file
    #[arg(long, global = true, default_value = "settings.kdl")]
    settings: String,

    /// Where build jobs run (overrides settings)
    #[arg(long, global = true, env = "GREENLIGHT_EXECUTOR")]
    executor: Option<ExecutorBackend>,

    /// Where promotions are applied (overrides settings)
    #[arg(long, global = true, env = "GREENLIGHT_CLUSTER")]
    cluster: Option<ClusterBackend>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a topology file
    Validate {
        /// Path to the topology file
        #[arg(default_value = "greenlight.kdl")]
        path: String,
    },
    /// Print the provisioning order
    Plan {
        #[arg(default_value = "greenlight.kdl")]
        path: String,
    },
    /// Provision the stack and print its outputs
    Up {
        #[arg(default_value = "greenlight.kdl")]
        path: String,
    },
    /// Print the outputs recorded by the last `up`
    Outputs,
    /// Run one lane for a commit locally
    Run {
        #[arg(default_value = "greenlight.kdl")]
        path: String,
        /// Pipeline lane to run
        #[arg(long)]
        lane: String,
        /// Commit id to build
        #[arg(long)]
        commit: String,
        /// Approve every gate without asking
        #[arg(long)]
        auto_approve: bool,
    },
    /// Provision the stack and serve the HTTP API
    Serve {
        #[arg(default_value = "greenlight.kdl")]
        path: String,
        /// Address to listen on (overrides settings)
        #[arg(long, env = "GREENLIGHT_BIND")]
        bind: Option<String>,
    },
    /// Approve the gate a lane is waiting on
    Approve {
        lane: String,
        #[arg(long)]
        by: Option<String>,
        /// API server URL
        #[arg(long, env = "GREENLIGHT_API_URL", default_value = "http://localhost:3000")]
        api_url: String,
    },
    /// Reject the gate a lane is waiting on
    Reject {
        lane: String,
        #[arg(long)]
        by: Option<String>,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, env = "GREENLIGHT_API_URL", default_value = "http://localhost:3000")]
        api_url: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut settings = greenlight_config::RuntimeSettings::load(&cli.settings)?;
    if let Some(executor) = cli.executor {
        settings.executor = executor;
    }
    if let Some(cluster) = cli.cluster {
        settings.cluster = cluster;
    }

    match cli.command {
        Commands::Validate { path } => {
            commands::stack::validate(&path)?;
        }
        Commands::Plan { path } => {
            commands::stack::plan(&path)?;
        }
        Commands::Up { path } => {
            commands::stack::up(&path, &settings).await?;
        }
        Commands::Outputs => {
            commands::stack::outputs(&settings).await?;
        }
        Commands::Run {
            path,
            lane,
            commit,
            auto_approve,
        } => {
            commands::run::run_lane(&path, &settings, &lane, &commit, auto_approve).await?;
        }
        Commands::Serve { path, bind } => {
            if let Some(bind) = bind {
                settings.bind = bind;
            }
            commands::serve::serve(&path, &settings).await?;
        }
        Commands::Approve { lane, by, api_url } => {
            commands::lanes::approve(&api_url, &lane, by).await?;
        }
        Commands::Reject {
            lane,
            by,
            reason,
            api_url,
        } => {
            commands::lanes::reject(&api_url, &lane, by, reason).await?;
        }
    }

    Ok(())
}
