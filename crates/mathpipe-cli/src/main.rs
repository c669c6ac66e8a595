//! mathpipe CLI - solve math problems through the verified LLM pipeline
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `mathpipe=info`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use mathpipe_core::{PipelineResult, Problem};
use mathpipe_runtime::{
    ArithmeticTool, MathTool, Orchestrator, PipelineConfig, ProviderPool, ProviderRegistry,
};

/// mathpipe - routed, verified and explained math solutions
#[derive(Parser)]
#[command(name = "mathpipe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve a problem
    Solve {
        /// Problem text
        problem: String,

        /// Pipeline configuration file (YAML)
        #[arg(short, long, env = "MATHPIPE_CONFIG")]
        config: Option<PathBuf>,

        /// Provider priority, e.g. `groq,gemini`
        #[arg(long, value_delimiter = ',')]
        provider_order: Option<Vec<String>>,

        /// Solver retries allowed after a rejection
        #[arg(long)]
        max_solve_retries: Option<u32>,

        /// Request deadline, e.g. `30s`
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Skip routing when the category is already known
        #[arg(long)]
        domain_hint: Option<String>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List provider types and their health
    Providers {
        /// Pipeline configuration file (YAML)
        #[arg(short, long, env = "MATHPIPE_CONFIG")]
        config: Option<PathBuf>,

        /// Run each configured provider's health check
        #[arg(long)]
        check: bool,
    },

    /// Evaluate an arithmetic expression with the math tool
    Eval {
        /// Expression, e.g. `2^10 - sqrt(16)`
        expression: String,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Configuration file (YAML)
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mathpipe=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Solve {
            problem,
            config,
            provider_order,
            max_solve_retries,
            timeout,
            domain_hint,
            json,
        } => {
            let overrides = Overrides {
                provider_order,
                max_solve_retries,
                timeout,
            };
            execute_solve(problem, config.as_deref(), overrides, domain_hint, json).await
        }
        Commands::Providers { config, check } => execute_providers(config.as_deref(), check).await,
        Commands::Eval { expression } => execute_eval(&expression).await,
        Commands::CheckConfig { file } => execute_check_config(&file),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Command-line overrides, applied after the file and the environment.
#[derive(Default)]
struct Overrides {
    provider_order: Option<Vec<String>>,
    max_solve_retries: Option<u32>,
    timeout: Option<Duration>,
}

fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => PipelineConfig::default(),
    };

    config
        .apply_env_overrides(|key| std::env::var(key).ok())
        .context("Invalid environment override")?;

    if let Some(order) = overrides.provider_order {
        config.provider_order = order;
    }
    if let Some(retries) = overrides.max_solve_retries {
        config.max_solve_retries = retries;
    }
    if let Some(timeout) = overrides.timeout {
        config.request_timeout = timeout;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loading configuration");
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn execute_solve(
    text: String,
    config_path: Option<&Path>,
    overrides: Overrides,
    domain_hint: Option<String>,
    json: bool,
) -> Result<ExitCode> {
    let config = load_config(config_path, overrides)?;
    let orchestrator = Orchestrator::builder()
        .config(config)
        .build()
        .context("Failed to build pipeline")?;

    let mut problem = Problem::new(text);
    if let Some(hint) = domain_hint {
        problem = problem.with_domain_hint(hint);
    }

    let result = orchestrator.handle(problem).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(result: &PipelineResult) {
    match result {
        PipelineResult::Success {
            classification,
            solution,
            verification,
            explanation,
            retries,
            ..
        } => {
            println!(
                "Category: {} (confidence {:.2})",
                classification.category, classification.confidence
            );
            println!();
            for (i, step) in solution.steps.iter().enumerate() {
                if step.expression.is_empty() {
                    println!("  {}. {}", i + 1, step.description);
                } else {
                    println!("  {}. {}    {}", i + 1, step.description, step.expression);
                }
            }
            for call in &solution.tool_calls {
                match (call.value, &call.error) {
                    (Some(value), _) => println!("     [{}] {} = {}", call.tool, call.expression, value),
                    (None, Some(error)) => println!("     [{}] {}: {}", call.tool, call.expression, error),
                    (None, None) => {}
                }
            }
            println!();
            println!("Answer: {}", solution.final_answer);
            println!(
                "Verified with confidence {:.2} after {} retr{}",
                verification.confidence,
                retries,
                if *retries == 1 { "y" } else { "ies" }
            );

            if let Some(explanation) = explanation {
                println!();
                println!("{}", explanation.narrative);
                if !explanation.key_concepts.is_empty() {
                    println!();
                    println!("Key concepts: {}", explanation.key_concepts.join(", "));
                }
            }
        }
        PipelineResult::Failed {
            failure_kind,
            message,
            best_solution,
            ..
        } => {
            println!("Failed ({}): {}", failure_kind, message);
            if let Some(best) = best_solution {
                println!("Best unverified answer: {}", best.final_answer);
            }
        }
    }

    println!();
    println!("Stages:");
    for record in result.attempts() {
        let provider = record.provider_used.as_deref().unwrap_or("-");
        let status = if record.is_error() { "error" } else { "ok" };
        println!(
            "  {:<9} {:<24} {:<8} {:<6} {:?}",
            record.stage.as_str(),
            record.input_ref,
            provider,
            status,
            record.latency
        );
    }
}

async fn execute_providers(config_path: Option<&Path>, check: bool) -> Result<ExitCode> {
    let registry = ProviderRegistry::with_defaults();

    if !check {
        for (name, description) in registry.describe() {
            println!("{:<10} {}", name, description);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(config_path, Overrides::default())?;
    let pool = ProviderPool::from_config(&config, &registry).context("Failed to build provider pool")?;

    let mut healthy = 0;
    for (name, ok) in pool.health_check_all().await {
        println!("{:<10} {}", name, if ok { "ready" } else { "unavailable" });
        if ok {
            healthy += 1;
        }
    }

    Ok(if healthy > 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn execute_eval(expression: &str) -> Result<ExitCode> {
    let tool = ArithmeticTool::default();
    let value = tool
        .execute(expression)
        .await
        .with_context(|| format!("Could not evaluate '{}'", expression))?;
    println!("{}", value);
    Ok(ExitCode::SUCCESS)
}

fn execute_check_config(path: &Path) -> Result<ExitCode> {
    let config = read_config_file(path)?;
    config.validate().context("Invalid configuration")?;

    let registry = ProviderRegistry::with_defaults();
    let unknown: Vec<&str> = config
        .provider_order
        .iter()
        .map(String::as_str)
        .filter(|name| !registry.has_provider(name))
        .collect();
    if !unknown.is_empty() {
        bail!(
            "Unknown provider(s): {} (available: {})",
            unknown.join(", "),
            registry.available_types().join(", ")
        );
    }

    println!("Configuration is valid.");
    println!("  providers: {}", config.provider_order.join(" -> "));
    println!(
        "  retries: {} per provider, {} solver retries",
        config.retry_budget_per_provider, config.max_solve_retries
    );
    println!(
        "  request timeout: {}",
        humantime::format_duration(config.request_timeout)
    );
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_solve_flags_parse() {
        let cli = Cli::try_parse_from([
            "mathpipe",
            "solve",
            "Solve 2x = 6",
            "--provider-order",
            "groq,gemini",
            "--timeout",
            "45s",
        ])
        .unwrap();

        match cli.command {
            Commands::Solve {
                provider_order,
                timeout,
                ..
            } => {
                assert_eq!(
                    provider_order,
                    Some(vec!["groq".to_string(), "gemini".to_string()])
                );
                assert_eq!(timeout, Some(Duration::from_secs(45)));
            }
            _ => panic!("expected solve"),
        }
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "provider_order: [gemini]\nmax_solve_retries: 1\nrequest_timeout: 10s"
        )
        .unwrap();

        let config = load_config(
            Some(file.path()),
            Overrides {
                max_solve_retries: Some(4),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.provider_order, vec!["gemini".to_string()]);
        assert_eq!(config.max_solve_retries, 4);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_check_config_rejects_unknown_provider() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "provider_order: [openai]").unwrap();
        assert!(execute_check_config(file.path()).is_err());
    }
}
