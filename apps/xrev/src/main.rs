//! # xrev
//!
//! The command-line binary for the xrev revision-tracking engine.
//!
//! ## Usage
//!
//! ```bash
//! xrev init
//! xrev commit -m "first draft" book.json chapters/one.json
//! xrev status book.json
//! xrev migrate book.json && xrev commit -m "follow upstream" book.json
//! xrev resolve "book:3/intro/para"
//! xrev checkout book.json --latest -o book.latest.json
//! ```
//!
//! Logging goes to stderr; `RUST_LOG` filters it and `XREV_LOG_FORMAT=json`
//! switches to machine-parseable output.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xrev::cli;

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let log_format = std::env::var("XREV_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "xrev=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
