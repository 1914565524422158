use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;

use taskweave::graph::ExecutionUnit;
use taskweave::plan::Plan;
use taskweave::workflow::validate_plan;
use taskweave::{init_tracing, EngineConfig};

#[derive(Parser)]
#[command(
    name = "taskweave",
    version,
    about = "Dependency-aware workflow and swarm orchestration"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskweave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Config,
    /// Validate a plan and print its execution stages
    Plan {
        /// Planner output: a JSON plan, or prose containing one
        file: PathBuf,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(EngineConfig::default())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "taskweave", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    init_tracing(&config.log);

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Plan { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let plan = Plan::from_model_output(&text)?;
            if let Some(analysis) = &plan.analysis {
                println!("Analysis: {}\n", analysis);
            }

            let units: Vec<ExecutionUnit> = plan.steps.into_iter().map(ExecutionUnit::from).collect();
            let graph = validate_plan(units, &config.workflow)?;
            info!(units = graph.len(), "Plan is valid");

            for (n, stage) in graph.stages().iter().enumerate() {
                println!("Stage {}:", n + 1);
                for id in stage {
                    if let Some(unit) = graph.get(id) {
                        let deps = if unit.dependencies().is_empty() {
                            String::new()
                        } else {
                            format!(" (after {})", unit.dependencies().join(", "))
                        };
                        println!("  [{}] {} - {}{}", unit.kind(), unit.id(), unit.name(), deps);
                    }
                }
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
