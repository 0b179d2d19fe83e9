use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};

use airtable_resilience::config::{load_config, Algorithm, ResilienceConfig};
use airtable_resilience::http::{ClientOptions, ServicePreset};
use airtable_resilience::observability::logging::init_logging;
use airtable_resilience::observability::metrics::init_metrics;
use airtable_resilience::ResilienceContext;

#[derive(Parser)]
#[command(name = "resilience-cli")]
#[command(about = "Inspect and exercise the resilience configuration", long_about = None)]
struct Cli {
    /// TOML config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    SlidingWindow,
    FixedWindow,
    TokenBucket,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::SlidingWindow => Algorithm::SlidingWindow,
            AlgorithmArg::FixedWindow => Algorithm::FixedWindow,
            AlgorithmArg::TokenBucket => Algorithm::TokenBucket,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config file and report every problem
    Validate,
    /// Show the breaker config each upstream service resolves to
    Breakers,
    /// Probe every configured upstream's /health endpoint
    Health,
    /// Count one request against a rate limit and print the decision
    CheckLimit {
        identifier: String,
        #[arg(long, default_value_t = 60)]
        limit: u64,
        #[arg(long, default_value_t = 60)]
        window: u64,
        #[arg(long, value_enum, default_value_t = AlgorithmArg::SlidingWindow)]
        algorithm: AlgorithmArg,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error: {}", err);
                std::process::exit(1);
            }
        },
        None => ResilienceConfig::default(),
    };
    init_logging(&config.observability)?;

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr)?;
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    match cli.command {
        Commands::Validate => {
            println!(
                "Config OK: {} upstream service(s), default breaker trips after {} failures",
                config.services.len(),
                config.circuit_breaker.failure_threshold
            );
        }
        Commands::Breakers => {
            print_json(&breaker_table(&config))?;
        }
        Commands::Health => {
            let context = ResilienceContext::from_config(config).await?;
            let health = context.services.health_check_all().await;
            print_json(&serde_json::to_value(&health)?)?;
            context.hooks().run_shutdown().await;
        }
        Commands::CheckLimit {
            identifier,
            limit,
            window,
            algorithm,
        } => {
            let context = ResilienceContext::from_config(config).await?;
            let decision = context
                .limiter
                .is_allowed(&identifier, limit, window, algorithm.into())
                .await?;
            print_json(&serde_json::to_value(&decision)?)?;
        }
    }

    Ok(())
}

fn breaker_table(config: &ResilienceConfig) -> Value {
    let configured: Vec<Value> = config
        .services
        .iter()
        .map(|service| {
            json!({
                "service": service.name,
                "base_url": service.base_url,
                "circuit_breaker": ClientOptions::from_service(service).breaker_config(),
            })
        })
        .collect();

    let presets: Vec<Value> = [
        airtable_resilience::http::registry::MCP_SERVER,
        airtable_resilience::http::registry::AIRTABLE_GATEWAY,
        airtable_resilience::http::registry::LLM_ORCHESTRATOR,
    ]
    .iter()
    .map(|preset: &ServicePreset| {
        json!({
            "service": preset.name,
            "base_url": preset.base_url,
            "circuit_breaker": preset.breaker_config(),
        })
    })
    .collect();

    json!({
        "default": config.circuit_breaker,
        "services": configured,
        "presets": presets,
    })
}

fn print_json(value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
