pub mod cloud;
pub mod config;
pub mod har;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stampede")]
#[command(about = "Scriptable load-testing engine", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load test script
    Run {
        /// Path to the script file
        script: PathBuf,

        /// Override the number of VUs
        #[arg(short = 'u', long)]
        vus: Option<u64>,

        /// Override the test duration, e.g. "30s"
        #[arg(short, long)]
        duration: Option<String>,

        /// Start the test in a paused state
        #[arg(long, default_value_t = false)]
        paused: bool,

        /// Path to an options file (YAML/JSON) applied over the script's
        /// exported options
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// This instance's execution segment, e.g. "1/4:1/2"
        #[arg(long)]
        execution_segment: Option<String>,

        /// Boundaries of all segments, e.g. "0,1/4,1/2,1"
        #[arg(long)]
        execution_segment_sequence: Option<String>,

        /// Export the final summary to a JSON file
        #[arg(long)]
        export_json: Option<PathBuf>,
    },
    /// Convert a HAR recording to a runnable script
    Convert {
        /// Path to the input .har file
        #[arg(short, long)]
        input: PathBuf,

        /// Path to the output script; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Store a cloud API token
    Login {
        token: String,

        /// Custom API endpoint
        #[arg(long)]
        api_url: Option<String>,
    },
}
