//! peercall - peer-to-peer voice call signaling
//!
//! Call setup over a shared document store: offers, answers, candidates
//! and hangups are documents both parties listen to.

mod calling;
mod config;
mod console;
mod models;
mod store;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{Config, StoreBackend};
use console::demo::{run_demo, DemoOptions};

#[derive(Parser)]
#[command(name = "peercall")]
#[command(about = "Voice call signaling over a shared document store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Memory,
    Firestore,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the local identity and store settings to the config file
    Init {
        /// Participant id other parties call you by
        #[arg(short, long)]
        identity: String,

        /// Document store backend
        #[arg(long, value_enum)]
        backend: Option<Backend>,

        /// Firestore project id
        #[arg(long)]
        project: Option<String>,

        /// Firestore web API key
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Show the current configuration
    Status,

    /// Interactive phone: place and answer calls from the terminal
    Phone,

    /// Run a complete call between two local parties
    Demo {
        /// Replay the offer to show duplicate suppression
        #[arg(long)]
        redeliver: bool,

        /// Let the caller hang up while the callee is ringing
        #[arg(long)]
        caller_hangs_up: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Init {
            identity,
            backend,
            project,
            api_key,
        } => {
            let mut config = Config::load()?;
            config.identity = Some(identity);
            if let Some(backend) = backend {
                config.store.backend = match backend {
                    Backend::Memory => StoreBackend::Memory,
                    Backend::Firestore => StoreBackend::Firestore,
                };
            }
            if project.is_some() {
                config.store.project_id = project;
            }
            if api_key.is_some() {
                config.store.api_key = api_key;
            }
            config.save()?;
            tracing::info!("Saved config to {}", Config::config_path()?.display());
        }
        Commands::Status => {
            let config = Config::load()?;
            println!("Config:   {}", Config::config_path()?.display());
            println!(
                "Identity: {}",
                config.identity.as_deref().unwrap_or("(not set)")
            );
            println!("Store:    {:?}", config.store.backend);
            if let Some(ref project) = config.store.project_id {
                println!("Project:  {} ({})", project, config.store.database);
            }
            match config.calls.ring_timeout_secs {
                Some(secs) => println!("Ring timeout: {}s", secs),
                None => println!("Ring timeout: none"),
            }
        }
        Commands::Phone => {
            let config = Config::load()?;
            console::run_phone(&config).await?;
        }
        Commands::Demo {
            redeliver,
            caller_hangs_up,
        } => {
            let report = run_demo(DemoOptions {
                redeliver,
                caller_hangs_up,
            })
            .await?;
            println!("Call {}", report.call_id);
            println!("  caller: {:?}", report.caller);
            println!("  callee: {:?}", report.callee);
            println!("  rang {} time(s)", report.rings);
        }
    }

    Ok(())
}
