// ABOUTME: Command-line interface definition for the fieldlog binary.
// ABOUTME: Subcommands inspect local state and drive sync and hydration by hand.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "fieldlog", version, about = "Inspect and sync locally recorded field jobs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show engine counters: active recordings, cache size, queue depth.
    Status,
    /// List jobs waiting to be synced, with their retry state.
    Pending,
    /// Show cached jobs for a field, newest first.
    History {
        field: String,
        /// Only jobs of this type (sow, harvest, spray, irrigate).
        #[arg(long = "type")]
        job_type: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run one sync pass now.
    Sync,
    /// Pull recent jobs from the server into the local cache.
    Hydrate {
        /// Field to hydrate; repeat for several. Defaults to every known field.
        #[arg(long = "field")]
        fields: Vec<String>,
        /// Ignore the hydration interval.
        #[arg(long)]
        force: bool,
    },
    /// Erase all local state, including unsynced jobs.
    Reset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },
}
