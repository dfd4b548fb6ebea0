use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vmfinder_adapters::supported_providers;
use vmfinder_core::Provider;
use vmfinder_storage::DatasetStore;
use vmfinder_sync::{orchestrator_from_config, CycleOutcome, RefreshConfig};

#[derive(Debug, Parser)]
#[command(name = "vmfinder")]
#[command(about = "Cloud VM pricing aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one refresh cycle now, for every provider or just one.
    Refresh {
        /// Provider slug or name, e.g. `hetzner-cloud`.
        #[arg(long)]
        provider: Option<String>,
    },
    /// Keep refreshing on each provider's interval until Ctrl-C.
    Run,
    /// Show record counts and freshness per provider.
    Status,
    /// List known providers and whether an adapter exists for them.
    Providers,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn print_outcomes(outcomes: &[(Provider, CycleOutcome)]) {
    for (provider, outcome) in outcomes {
        println!("{:<20} {outcome}", provider.display_name());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = RefreshConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Refresh { provider: None }) {
        Commands::Refresh { provider } => {
            let orchestrator = orchestrator_from_config(&config).await?;
            let outcomes = match provider {
                Some(name) => {
                    let provider = Provider::parse(&name)
                        .with_context(|| format!("unknown provider `{name}`"))?;
                    vec![(provider, orchestrator.run_cycle(provider).await)]
                }
                None => orchestrator.refresh_all_now().await,
            };
            print_outcomes(&outcomes);
        }
        Commands::Run => {
            let orchestrator = orchestrator_from_config(&config).await?;
            orchestrator.start().await?;
            if config.refresh_on_start {
                let initial = orchestrator.clone();
                tokio::spawn(async move {
                    let outcomes = initial.refresh_all_now().await;
                    print_outcomes(&outcomes);
                });
            }
            info!(
                providers = orchestrator.providers().len(),
                "refresh scheduler running; Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            orchestrator.stop().await?;
        }
        Commands::Status => {
            let store = vmfinder_sync::build_store(&config).await?;
            let freshness = store.freshness().await.context("reading dataset freshness")?;
            if freshness.is_empty() {
                println!("dataset is empty");
            }
            for entry in freshness {
                let updated = entry
                    .last_updated
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("{:<20} {:>6} records  updated {updated}", entry.provider, entry.records);
            }
        }
        Commands::Providers => {
            let supported = supported_providers();
            for provider in Provider::ALL {
                let adapter = if supported.contains(&provider) {
                    format!(
                        "every {}h",
                        config.intervals.get(&provider).copied().unwrap_or_default()
                    )
                } else {
                    "no adapter".to_string()
                };
                println!("{:<20} {:<20} {adapter}", provider.slug(), provider.display_name());
            }
        }
    }

    Ok(())
}
