use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use tollgate_core::config::{Config, ProviderStyle};
use tollgate_core::provider::ProviderRegistry;
use tollgate_core::trust::{TrustDecision, TrustEvaluator, TrustStoreRef};

#[derive(Parser)]
#[command(name = "tollgate", about = "Social-login gateway for protected resources")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve,
    /// Check config and resolve every provider
    Validate,
    /// Check whether a provider's token endpoint is trusted
    Probe {
        /// Provider name from the config
        provider: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tollgate=info,tower_http=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Plain => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = tollgate_core::config::resolve_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => {
            let metrics_handle = if config.metrics.enabled {
                let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
                    .install_recorder()?;
                tracing::info!("prometheus recorder installed");
                Some(handle)
            } else {
                None
            };
            tollgate_api::serve(config, metrics_handle).await?;
        }
        Command::Validate => {
            tracing::info!("config loaded successfully");
            let registry = ProviderRegistry::build(&config.providers, &config.transport).await?;
            print_providers(&config, &registry);
        }
        Command::Probe { provider } => probe(&config, &provider).await?,
    }

    Ok(())
}

fn print_providers(config: &Config, registry: &ProviderRegistry) {
    if registry.is_empty() {
        println!("No providers configured.");
        return;
    }
    println!("{:<16} {:<6} {:<10} {}", "Provider", "Style", "Trust", "Callback URL");
    println!("{}", "-".repeat(90));
    let mut names: Vec<&str> = registry.names().collect();
    names.sort_unstable();
    for name in names {
        let Some(provider) = registry.get(name) else {
            println!(
                "{:<16} {:<6} {:<10} {}",
                name,
                "-",
                "-",
                "discovery failed, retried on first login"
            );
            continue;
        };
        let style = match provider.style() {
            ProviderStyle::OAuth => "oauth",
            ProviderStyle::Oidc => "oidc",
        };
        let trust = match &provider.config.trust_store {
            TrustStoreRef::System => "system",
            TrustStoreRef::PemFile(_) => "pem",
        };
        println!(
            "{:<16} {:<6} {:<10} {}",
            name,
            style,
            trust,
            config.server.callback_url(name)
        );
    }
    println!("\n{} provider(s), {} resource(s)", registry.len(), config.resources.len());
}

/// Handshake with the provider's token endpoint using its trust store.
async fn probe(config: &Config, name: &str) -> anyhow::Result<()> {
    if config.provider(name).is_none() {
        anyhow::bail!("provider '{name}' is not configured");
    }
    let registry = ProviderRegistry::build(&config.providers, &config.transport).await?;
    let provider = match registry.resolve(name).await {
        Some(Ok(provider)) => provider,
        Some(Err(failure)) => anyhow::bail!("provider '{name}' did not resolve: {failure}"),
        None => anyhow::bail!("provider '{name}' is not configured"),
    };

    let url = url::Url::parse(&provider.config.token_url)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("token URL has no host: {url}"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow::anyhow!("token URL has no port: {url}"))?;

    let evaluator = TrustEvaluator::new(config.transport.connect_timeout());
    let decision = evaluator.evaluate(host, port, &provider.trust_store).await;
    let verdict = match &decision {
        TrustDecision::Trusted => "trusted",
        TrustDecision::UntrustedChain(_) => "untrusted chain",
        TrustDecision::HandshakeFailure(_) => "handshake failure",
        TrustDecision::ConnectFailure(_) => "connect failure",
    };
    println!(
        "{name}: {host}:{port} via {} -> {verdict}",
        provider.config.trust_store
    );
    if let Some(reason) = decision.reason() {
        println!("  {reason}");
        anyhow::bail!("provider '{name}' is not trusted");
    }
    Ok(())
}
