//! Command-line interface definitions using clap derive API.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Agricultural advisory assistant CLI
#[derive(Parser)]
#[command(name = "agri-advisor")]
#[command(about = "Multi-agent advisory assistant for farmers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Who is asking, and from where.
#[derive(Args, Debug, Clone)]
pub struct FarmerArgs {
    /// Farmer identifier used for memory
    #[arg(long, default_value = "local")]
    pub user: String,

    /// Location for weather lookups
    #[arg(long)]
    pub location: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Answer a single question
    Ask {
        /// The farmer's question
        query: String,

        #[command(flatten)]
        farmer: FarmerArgs,

        /// Print the full answer as JSON
        #[arg(long)]
        json: bool,
    },
    /// Interactive session; type `quit` to exit
    Chat {
        #[command(flatten)]
        farmer: FarmerArgs,
    },
    /// Ingest JSON knowledge files from a directory and write the snapshot
    Ingest {
        /// Directory containing crop_diseases.json, soil_data.json, ...
        dir: PathBuf,
    },
    /// List knowledge collections with document counts
    Collections,
}
