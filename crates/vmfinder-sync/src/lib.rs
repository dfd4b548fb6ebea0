//! Refresh configuration, provider registry and the refresh orchestrator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;
use tracing::info;
use vmfinder_adapters::{
    adapter_for_provider, supported_providers, AdapterSettings, AwsSettings,
    HetznerCloudSettings, HetznerRobotSettings,
};
use vmfinder_core::Provider;
use vmfinder_storage::{
    DatasetStore, HttpClientConfig, HttpFetcher, JsonFileDatasetStore, MemoryDatasetStore,
    PgDatasetStore,
};

mod orchestrator;

pub use orchestrator::{
    CycleOutcome, ProviderStatus, RefreshOrchestrator, RefreshState, ScheduledAdapter,
};

pub const CRATE_NAME: &str = "vmfinder-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "file" | "json" => Ok(StoreBackend::File),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => bail!("unknown VMFINDER_STORE `{other}` (expected memory, file or postgres)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub adapters: AdapterSettings,
    pub http: HttpClientConfig,
    /// Refresh period per provider, in hours.
    pub intervals: BTreeMap<Provider, u64>,
    pub store: StoreBackend,
    pub data_file: PathBuf,
    pub database_url: Option<String>,
    pub refresh_on_start: bool,
    pub workspace_root: PathBuf,
}

impl RefreshConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any name-to-value lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let parsed = |name: &str, default: u64| -> Result<u64> {
            match var(name) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("parsing {name}={raw}")),
                None => Ok(default),
            }
        };
        let flag = |name: &str, default: bool| {
            var(name)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(default)
        };

        let intervals = BTreeMap::from([
            (Provider::Aws, parsed("REFRESH_INTERVAL_AWS", 12)?),
            (Provider::HetznerCloud, parsed("REFRESH_INTERVAL_HETZNER_CLOUD", 12)?),
            (
                Provider::HetznerBareMetal,
                parsed("REFRESH_INTERVAL_HETZNER_BARE_METAL", 24)?,
            ),
        ]);

        let timeout = Duration::from_secs(parsed("VMFINDER_HTTP_TIMEOUT_SECS", 30)?);
        let adapters = AdapterSettings {
            aws: AwsSettings {
                access_key_id: var("AWS_ACCESS_KEY_ID"),
                secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
                session_token: var("AWS_SESSION_TOKEN"),
                timeout,
                ..AwsSettings::default()
            },
            hetzner_cloud: HetznerCloudSettings {
                api_token: var("HETZNER_CLOUD_API_TOKEN"),
                ..HetznerCloudSettings::default()
            },
            hetzner_robot: HetznerRobotSettings {
                username: var("HETZNER_ROBOT_USERNAME"),
                password: var("HETZNER_ROBOT_PASSWORD"),
                include_server_market: flag("HETZNER_INCLUDE_SERVER_MARKET", true),
                ..HetznerRobotSettings::default()
            },
        };

        let http = HttpClientConfig {
            timeout,
            user_agent: Some(
                var("VMFINDER_USER_AGENT").unwrap_or_else(|| "vmfinder-bot/0.1".to_string()),
            ),
            ..HttpClientConfig::default()
        };

        Ok(Self {
            adapters,
            http,
            intervals,
            store: var("VMFINDER_STORE")
                .map(|v| v.parse::<StoreBackend>())
                .transpose()?
                .unwrap_or(StoreBackend::File),
            data_file: var("VMFINDER_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/vm_pricing.json")),
            database_url: var("DATABASE_URL"),
            refresh_on_start: flag("VMFINDER_REFRESH_ON_START", true),
            workspace_root: PathBuf::from("."),
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("providers.yaml")
    }

    /// Enabled providers and their periods, env defaults overridden by `registry`.
    pub fn schedules(&self, registry: Option<&ProviderRegistry>) -> Result<Vec<ProviderSchedule>> {
        let mut schedules: Vec<ProviderSchedule> = supported_providers()
            .into_iter()
            .map(|provider| ProviderSchedule {
                provider,
                interval_hours: self.intervals.get(&provider).copied().unwrap_or(24),
            })
            .collect();

        let Some(registry) = registry else {
            return Ok(schedules);
        };

        for entry in &registry.providers {
            let provider = Provider::parse(&entry.provider).with_context(|| {
                format!("unknown provider `{}` in providers.yaml", entry.provider)
            })?;
            let Some(pos) = schedules.iter().position(|s| s.provider == provider) else {
                bail!("provider `{provider}` has no adapter");
            };
            if !entry.enabled {
                info!(provider = %provider, "provider disabled in registry");
                schedules.remove(pos);
                continue;
            }
            if let Some(hours) = entry.interval_hours {
                schedules[pos].interval_hours = hours;
            }
        }
        Ok(schedules)
    }
}

/// `providers.yaml`: which adapters run, and how often.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub provider: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub interval_hours: Option<u64>,
    #[serde(default)]
    pub notes: Option<String>,
}

const SECS_PER_HOUR: u64 = 3600;

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSchedule {
    pub provider: Provider,
    pub interval_hours: u64,
}

impl ProviderSchedule {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.saturating_mul(SECS_PER_HOUR))
    }
}

/// Reads the registry file; a missing file means "every supported provider".
pub async fn load_provider_registry(path: &Path) -> Result<Option<ProviderRegistry>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let registry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(registry))
}

pub async fn build_store(config: &RefreshConfig) -> Result<Arc<dyn DatasetStore>> {
    let store: Arc<dyn DatasetStore> = match config.store {
        StoreBackend::Memory => Arc::new(MemoryDatasetStore::new()),
        StoreBackend::File => Arc::new(
            JsonFileDatasetStore::open(&config.data_file)
                .await
                .with_context(|| format!("opening {}", config.data_file.display()))?,
        ),
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required when VMFINDER_STORE=postgres")?;
            let store = PgDatasetStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.ensure_schema().await.context("creating vm_instances schema")?;
            Arc::new(store)
        }
    };
    Ok(store)
}

/// Wires config, registry file, HTTP client, adapters and store into an orchestrator.
pub async fn orchestrator_from_config(config: &RefreshConfig) -> Result<RefreshOrchestrator> {
    let registry = load_provider_registry(&config.registry_path()).await?;
    let schedules = config.schedules(registry.as_ref())?;
    let http = Arc::new(HttpFetcher::new(config.http.clone())?);
    let store = build_store(config).await?;

    let mut adapters = Vec::with_capacity(schedules.len());
    for schedule in schedules {
        let adapter = adapter_for_provider(schedule.provider, &config.adapters, Arc::clone(&http))
            .with_context(|| format!("no adapter registered for {}", schedule.provider))?;
        adapters.push(ScheduledAdapter {
            adapter: Arc::from(adapter),
            interval: schedule.interval(),
        });
    }
    RefreshOrchestrator::new(store, adapters)
}
