//! Trainer binary: folds dumped training artifacts into the rule table,
//! chain statistics and invalid-context tree.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use weft_train::{build_tree, collect_ids, merge_stats, PassConfig};

#[derive(Parser)]
#[command(name = "weft-train")]
#[command(about = "Offline statistics aggregation for weft training artifacts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Worker threads for artifact parsing
    #[arg(long, global = true, default_value_t = 4)]
    jobs: usize,

    /// Artifact files per work unit
    #[arg(long, global = true, default_value_t = 32)]
    group_size: usize,

    /// Merged work units between checkpoint attempts
    #[arg(long, global = true, default_value_t = 8)]
    checkpoint_interval: usize,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Assign rule ids to every rule text reachable from feedback
    CollectIds {
        /// Directory tree of .wft artifacts
        artifacts: PathBuf,

        /// Rule table checkpoint to create or resume
        #[arg(long, default_value = "rule-table.bin")]
        table: PathBuf,
    },
    /// Fold statement outcomes into ancestor-chain counters
    MergeStats {
        /// Directory tree of .wft artifacts
        artifacts: PathBuf,

        /// Rule table produced by collect-ids
        #[arg(long, default_value = "rule-table.bin")]
        table: PathBuf,

        /// Statistics checkpoint to create or resume
        #[arg(long, default_value = "chain-stats.bin")]
        stats: PathBuf,
    },
    /// Extract the invalid-context tree from merged statistics
    BuildTree {
        /// Rule table produced by collect-ids
        #[arg(long, default_value = "rule-table.bin")]
        table: PathBuf,

        /// Statistics produced by merge-stats
        #[arg(long, default_value = "chain-stats.bin")]
        stats: PathBuf,

        /// Where the tree is written
        #[arg(long, default_value = "invalid-tree.bin")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = PassConfig {
        jobs: cli.jobs,
        group_size: cli.group_size,
        checkpoint_interval: cli.checkpoint_interval,
    };
    match &cli.command {
        Commands::CollectIds { artifacts, table } => collect_ids(artifacts, table, &config),
        Commands::MergeStats {
            artifacts,
            table,
            stats,
        } => merge_stats(artifacts, table, stats, &config),
        Commands::BuildTree { table, stats, out } => build_tree(table, stats, out),
    }
}
