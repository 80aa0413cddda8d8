use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::config::{PlanMode, StoreSelection};
use floodgate::{GateBuilder, Outcome, RequestContext, Settings};

#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about = "Request rate limiting toolkit")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate a configuration file, then print the policy plan
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Send synthetic requests through a gate built from a configuration file
    Probe {
        #[arg(short, long)]
        config: PathBuf,

        /// Caller address
        #[arg(long)]
        ip: Option<std::net::IpAddr>,

        #[arg(long, default_value = "/")]
        path: String,

        #[arg(long, default_value = "GET")]
        method: String,

        /// Request header as NAME=VALUE, may be repeated
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Raw query string, e.g. "page=2&sort=asc"
        #[arg(long)]
        query: Option<String>,

        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Pause between requests
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Policy to apply in composite mode
        #[arg(long)]
        policy: Option<String>,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Probe {
            config,
            ip,
            path,
            method,
            headers,
            query,
            repeat,
            interval_ms,
            policy,
        } => {
            let method: http::Method = method
                .to_uppercase()
                .parse()
                .with_context(|| format!("invalid method '{}'", method))?;
            let mut request = RequestContext::new(method, path);
            if let Some(ip) = ip {
                request = request.with_remote_addr(ip);
            }
            for (name, value) in &headers {
                request = request.with_header(name, value);
            }
            if let Some(query) = &query {
                request = request.with_query(query);
            }

            probe(config, request, repeat, Duration::from_millis(interval_ms), policy).await
        }
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let settings = Settings::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let plan = settings.validate()?;

    let mode = match plan.mode {
        PlanMode::Single => "single",
        PlanMode::Composite => "composite",
    };
    println!("mode: {}", mode);
    for spec in &plan.policies {
        let store = match &spec.store {
            StoreSelection::Local => "local".to_string(),
            StoreSelection::Shared { alias, cache } => {
                format!("shared ({} -> {})", alias, cache.url)
            }
        };
        let key_builder = spec
            .key_builder
            .as_ref()
            .map(|k| format!("{:?}", k))
            .unwrap_or_else(|| "<programmatic>".to_string());
        println!(
            "policy {}: {:?} store={} ttl={}s key_builder={}",
            spec.name,
            spec.params,
            store,
            spec.ttl.as_secs(),
            key_builder
        );
    }

    info!(policies = plan.policies.len(), "Configuration is valid");
    Ok(())
}

async fn probe(
    path: PathBuf,
    request: RequestContext,
    repeat: u32,
    interval: Duration,
    policy: Option<String>,
) -> anyhow::Result<()> {
    let settings = Settings::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let mut builder = GateBuilder::new(settings);
    if let Some(policy) = policy {
        builder = builder.policy_resolver(move |_| Ok(policy.clone()));
    } else if builder
        .prepare()
        .is_err_and(|e| matches!(e, floodgate::ConfigError::MissingResolver))
    {
        bail!("composite configurations need --policy");
    }
    let gate = builder.build().await?;

    for n in 1..=repeat {
        match gate.check(&request).await {
            Ok(Outcome::Forward) => println!("{:>4} forward", n),
            Ok(Outcome::Reject(rejection)) => println!(
                "{:>4} reject {} {}",
                n,
                rejection.status().as_u16(),
                rejection.body_json()
            ),
            Err(e) => println!("{:>4} error {} {}", n, e.status_code().as_u16(), e),
        }

        if n < repeat && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    Ok(())
}
