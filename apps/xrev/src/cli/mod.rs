//! # xrev CLI Module
//!
//! This module implements the CLI interface for xrev.
//!
//! ## Available Commands
//!
//! - `init` - Create an empty repository file
//! - `commit` - Commit documents (and deletions) atomically
//! - `status` - Compare documents with the head layout
//! - `log` - Show the commit history
//! - `show` - Print the expanded content of one stored revision
//! - `checkout` - Rebuild a tracked document from the repository
//! - `resolve` - Resolve an `id:rev/prop/...` reference
//! - `migrate` - Retarget stale references in documents
//! - `lifeline` - List all revisions of an id

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use xrev_core::XrevError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// xrev - revision tracking for identified sub-trees of structured documents
///
/// Elements carrying an identity are stored once per revision; documents
/// include them by reference. Commits refuse branches and stolen identities.
#[derive(Parser, Debug)]
#[command(name = "xrev")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress informational output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the repository file
    #[arg(short = 'R', long, global = true, default_value = "xrev.repo")]
    pub repo: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new empty repository
    Init {
        /// Overwrite an existing repository file
        #[arg(short, long)]
        force: bool,
    },

    /// Commit documents atomically
    Commit {
        /// Commit message
        #[arg(short, long)]
        message: String,

        /// Document files (JSON element trees)
        files: Vec<PathBuf>,

        /// Stop tracking a path (repeatable)
        #[arg(long = "delete", value_name = "PATH")]
        deletions: Vec<String>,
    },

    /// Compare documents with the head layout
    Status {
        /// Document files to compare
        files: Vec<PathBuf>,
    },

    /// Show the commit history
    Log,

    /// Print the expanded content of one stored revision
    Show {
        /// Identity, e.g. `chapter1:4`
        xid: String,
    },

    /// Rebuild a tracked document from the head layout
    Checkout {
        /// Tracked path
        path: String,

        /// Follow every inclusion to the newest revision of its lifeline
        #[arg(long)]
        latest: bool,

        /// Write the document here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Resolve a reference of the form `id:rev/prop/...`
    Resolve {
        /// Reference to resolve
        xref: String,
    },

    /// Retarget stale references in documents
    Migrate {
        /// Document files to migrate in place
        files: Vec<PathBuf>,

        /// Report what would change without writing files
        #[arg(long)]
        dry_run: bool,
    },

    /// List all revisions of an id
    Lifeline {
        /// Lifeline id
        id: String,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), XrevError> {
    let out = Output {
        json: cli.json_mode,
        quiet: cli.quiet,
    };
    let repo = cli.repo.as_path();

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(repo, out, force),
        Some(Commands::Commit {
            message,
            files,
            deletions,
        }) => cmd_commit(repo, out, &message, &files, &deletions),
        Some(Commands::Status { files }) => cmd_status(repo, out, &files),
        Some(Commands::Log) => cmd_log(repo, out),
        Some(Commands::Show { xid }) => cmd_show(repo, out, &xid),
        Some(Commands::Checkout {
            path,
            latest,
            output,
        }) => cmd_checkout(repo, out, &path, latest, output.as_deref()),
        Some(Commands::Resolve { xref }) => cmd_resolve(repo, out, &xref),
        Some(Commands::Migrate { files, dry_run }) => cmd_migrate(repo, out, &files, dry_run),
        Some(Commands::Lifeline { id }) => cmd_lifeline(repo, out, &id),
        None => {
            // No subcommand - show status by default
            cmd_status(repo, out, &[])
        }
    }
}
