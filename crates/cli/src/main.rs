//! `codemode` — store lifecycle management.
//!
//! - `bootstrap` — push skills or tools from a directory to a store.
//! - `pull` — retrieve skills from a store to local files.
//! - `diff` — compare local skills against a remote store.
//! - `list` — list items in a store.
//!
//! Exit code 0 on success, nonzero on argument or connection errors.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod store;

#[derive(Parser)]
#[command(name = "codemode", about = "Skill and tool store lifecycle management")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum StoreKind {
    #[default]
    Skills,
    Tools,
}

#[derive(Subcommand)]
enum Command {
    /// Push skills or tools from a directory to a store.
    Bootstrap {
        /// Directory containing skill or tool files.
        #[arg(long)]
        source: PathBuf,
        /// Target store URL (e.g. redis://localhost:6379).
        #[arg(long)]
        target: String,
        /// Key prefix for items.
        #[arg(long, default_value = "skills")]
        prefix: String,
        /// Type of items to bootstrap.
        #[arg(long = "type", value_enum, default_value_t = StoreKind::Skills)]
        kind: StoreKind,
        /// Remove existing items before adding new ones.
        #[arg(long)]
        clear: bool,
    },
    /// Retrieve skills from a store to local files.
    Pull {
        #[arg(long)]
        target: String,
        #[arg(long, default_value = "skills")]
        prefix: String,
        /// Destination directory for skill files.
        #[arg(long)]
        dest: PathBuf,
    },
    /// Compare local skills against a remote store.
    Diff {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        target: String,
        #[arg(long, default_value = "skills")]
        prefix: String,
    },
    /// List items in a store.
    List {
        #[arg(long)]
        target: String,
        #[arg(long, default_value = "skills")]
        prefix: String,
        #[arg(long = "type", value_enum, default_value_t = StoreKind::Skills)]
        kind: StoreKind,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Bootstrap {
            source,
            target,
            prefix,
            kind,
            clear,
        } => match kind {
            StoreKind::Skills => {
                store::bootstrap_skills(&source, &target, &prefix, clear).await?;
            }
            StoreKind::Tools => {
                store::bootstrap_tools(&source, &target, &prefix, clear).await?;
            }
        },
        Command::Pull {
            target,
            prefix,
            dest,
        } => {
            store::pull(&target, &prefix, &dest).await?;
        }
        Command::Diff {
            source,
            target,
            prefix,
        } => {
            store::diff(&source, &target, &prefix).await?;
        }
        Command::List {
            target,
            prefix,
            kind,
        } => match kind {
            StoreKind::Skills => {
                store::list_skills(&target, &prefix).await?;
            }
            StoreKind::Tools => {
                store::list_tools(&target, &prefix).await?;
            }
        },
    }
    Ok(())
}
