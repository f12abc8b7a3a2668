use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use barrage::cli::config::Options;
use barrage::cli::{flag_overrides, Cli, Commands};
use barrage::engine::control::RunControl;
use barrage::engine::Engine;
use barrage::scenarios;

fn init_tracing(verbose: bool) {
    let default = if verbose { "barrage=debug" } else { "barrage=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_overrides(config: Option<&Path>, flags: Options) -> Result<Options> {
    let file = match config {
        Some(path) => Options::from_path(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => Options::default(),
    };
    Ok(file.merge(flags))
}

fn find_scenario(name: &str) -> Result<&'static scenarios::BuiltinScenario> {
    scenarios::find(name)
        .with_context(|| format!("unknown scenario '{}' (see `barrage list`)", name))
}

async fn run(
    scenario: String,
    base_url: String,
    config: Option<PathBuf>,
    flags: Options,
    json: bool,
    export_json: Option<PathBuf>,
) -> Result<i32> {
    let builtin = find_scenario(&scenario)?;
    let overrides = load_overrides(config.as_deref(), flags)?;
    let definition = builtin.definition(&base_url, Some(overrides))?;
    let engine = Engine::with_default_transport(definition.config.plan.max_vus());

    let control = Arc::new(RunControl::new());
    let stopper = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current iterations");
            stopper.abort("interrupted");
        }
    });

    info!(scenario = %scenario, target = %base_url, "running");
    let report = engine.run_with_control(&definition, control).await?;

    let rendered = report.to_json().context("serializing run report")?;
    if json {
        println!("{}", rendered);
    } else {
        report.print_summary();
    }
    if let Some(path) = export_json {
        std::fs::write(&path, &rendered)
            .with_context(|| format!("writing report to {}", path.display()))?;
        info!(path = %path.display(), "report exported");
    }
    Ok(report.exit_code())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            scenario,
            base_url,
            config,
            vus,
            duration,
            iterations,
            json,
            export_json,
        } => {
            let flags = flag_overrides(vus, duration, iterations);
            let code = run(scenario, base_url, config, flags, json, export_json).await?;
            std::process::exit(code);
        }
        Commands::Validate { scenario, config } => {
            let builtin = find_scenario(&scenario)?;
            let overrides = load_overrides(config.as_deref(), Options::default())?;
            let definition = builtin.definition(scenarios::DEFAULT_BASE_URL, Some(overrides))?;
            let config = &definition.config;
            println!("Scenario:   {}", definition.name);
            println!("Plan:       {}", config.plan);
            for threshold in &config.thresholds {
                println!(
                    "Threshold:  {} {}{}",
                    threshold.key(),
                    threshold.expression(),
                    if threshold.abort_on_fail { " (abort on fail)" } else { "" }
                );
            }
            println!("OK");
        }
        Commands::List => {
            for scenario in scenarios::ALL {
                let plan = (scenario.options)()
                    .resolve()
                    .map(|c| c.plan.to_string())
                    .unwrap_or_else(|e| format!("invalid: {}", e));
                println!("{:<20} {}", scenario.name, scenario.description);
                println!("{:<20} {}", "", plan);
            }
        }
        Commands::Schema => {
            let schema = schemars::schema_for!(Options);
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
    }
    Ok(())
}
