use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "phase-orchestrator")]
#[command(about = "Phase-completion orchestrator for partitioned batch pipelines")]
#[command(long_about = "Tracks processor completion events per (phase, partition key), advances the \
                       pipeline exactly once when a phase completes or its wait window closes, and \
                       self-heals keys whose downstream output never materialized.")]
pub struct Cli {
    /// Configuration file (defaults to ./phase-orchestrator.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON instead of a summary
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process one completion event (JSON) for a phase
    Handle {
        #[arg(long, help = "Phase the event belongs to")]
        phase: String,
        /// Event file; reads stdin when omitted
        #[arg(long, help = "Path to the JSON event (stdin if omitted)")]
        event: Option<PathBuf>,
    },
    /// Re-evaluate the timeout for one record and dispatch if it fires
    Evaluate {
        #[arg(long)]
        phase: String,
        #[arg(long, help = "Partition key of the record")]
        key: String,
    },
    /// Run a self-heal sweep
    Sweep {
        /// Additional partition keys to reconcile
        #[arg(long = "key", help = "Partition key to include even if inactive (repeatable)")]
        keys: Vec<String>,
        /// Keep sweeping on the configured interval until Ctrl-C
        #[arg(long, help = "Sweep every reconciler.sweep_interval_secs until interrupted")]
        watch: bool,
    },
    /// Show records, dispatch history and health for a partition key
    Status {
        #[arg(long)]
        key: String,
    },
    /// Clear a key's self-heal state (e.g. after fixing a failed_heal)
    ResetHealth {
        #[arg(long)]
        key: String,
    },
    /// Print the effective configuration as TOML
    Config,
}
