//! # Simtree - branchable trajectory store
//!
//! The main binary for the Simtree history store.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │               apps/simtree (THE BINARY)           │
//! │                                                   │
//! │   ┌─────────────┐         ┌─────────────┐         │
//! │   │    CLI      │         │  HTTP API   │         │
//! │   │   (clap)    │         │   (axum)    │         │
//! │   └──────┬──────┘         └──────┬──────┘         │
//! │          └───────────┬───────────┘                │
//! │                      ▼                            │
//! │              ┌───────────────┐                    │
//! │              │ simtree-core  │                    │
//! │              │  (THE LOGIC)  │                    │
//! │              └───────────────┘                    │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! simtree init
//! simtree simulation create -n cartpole -e CartPole-v1 -a ppo
//! simtree state create -o '{"x": 0}'
//! simtree run create -s 1 -n baseline -r 1
//! simtree state create -p 1 -s 1 -o '{"x": 1}' --reward 1.0 --run 1
//! simtree branch -r 1 -a 1 -n explore --overrides '{"lr": 0.01}'
//! simtree server --port 8080
//! ```

use clap::Parser;
use simtree::cli;
use simtree::settings::LogFormat;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    let settings = match cli.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    init_tracing(settings.logging.format);

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli, settings).await {
        tracing::error!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

/// Initialize tracing. `SIMTREE_LOG_FORMAT=json` enables machine-parseable output.
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "simtree=info,simtree_core=info,tower_http=debug".into());

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Print the Simtree startup banner.
fn print_banner() {
    println!(
        r#"
   ___ _         _
  / __(_)_ __  _| |_ _ _ ___ ___
  \__ \ | '  \|_   _| '_/ -_) -_)
  |___/_|_|_|_| |_| |_| \___\___|

  Branchable trajectory store v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
