use anyhow::{Context, Result};
use bk_local::cli::commands::{RunCommand, ValidateCommand};
use bk_local::cli::output::{style, CHECK, CROSS, INFO};
use bk_local::cli::{Cli, Command};
use bk_local::execution::{Orchestrator, Planner, RunError};
use bk_local::Pipeline;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await,
        Command::Validate(cmd) => validate_pipeline(cmd),
    }
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let config = cmd.to_config();
    println!(
        "{} Running {}",
        INFO,
        style(config.pipeline_path.display()).bold()
    );

    match Orchestrator::default().run(config).await {
        Ok(summary) => {
            let code = summary.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} {}", CROSS, style(&e).red());
            error!("{:#}", anyhow::Error::from(e));
            std::process::exit(1);
        }
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let planned = Pipeline::from_file(&cmd.pipeline)
        .map_err(RunError::from)
        .and_then(|pipeline| Ok((Planner::new().plan(&pipeline)?, pipeline)));

    match planned {
        Ok((plan, pipeline)) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Steps: {}", style(pipeline.step_count()).cyan());
            println!("  Jobs: {}", style(plan.len()).cyan());
            println!("  Widest layer: {}", style(plan.max_concurrency()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&plan.jobs)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}
