pub mod cli;
pub mod engine;
pub mod error;
pub mod scenarios;
pub mod stats;
pub mod utils;

pub use cli::config::{Options, RunConfig};
pub use engine::vu::{Iteration, VuContext};
pub use engine::{CustomMetric, Engine, EngineSettings, ScenarioDefinition};
pub use error::{ConfigError, EngineError};
pub use stats::RunReport;
pub use utils::parse_duration_str;
