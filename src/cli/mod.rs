pub mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::scenarios::DEFAULT_BASE_URL;
use config::Options;

#[derive(Parser)]
#[command(name = "barrage")]
#[command(about = "Load-testing engine for HTTP services", long_about = None, version)]
pub struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a built-in scenario
    Run {
        /// Scenario name (see `barrage list`)
        scenario: String,

        /// Base URL of the service under test
        #[arg(long, default_value = DEFAULT_BASE_URL)]
        base_url: String,

        /// Options file (YAML/JSON) layered over the scenario defaults
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of virtual users (rescales the peak of a ramping scenario)
        #[arg(long)]
        vus: Option<u64>,

        /// Run duration (e.g. "30s", "1m30s")
        #[arg(short, long)]
        duration: Option<String>,

        /// Iterations per virtual user
        #[arg(long)]
        iterations: Option<u64>,

        /// Print the run report as JSON instead of the summary
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Write the run report as JSON to a file
        #[arg(long)]
        export_json: Option<PathBuf>,
    },
    /// Resolve a scenario's options and report configuration errors
    Validate {
        scenario: String,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List built-in scenarios
    List,
    /// Print the JSON schema of the options file
    Schema,
}

/// Options set by command-line flags. These win over the options file.
pub fn flag_overrides(vus: Option<u64>, duration: Option<String>, iterations: Option<u64>) -> Options {
    Options {
        vus,
        duration,
        iterations,
        ..Default::default()
    }
}
