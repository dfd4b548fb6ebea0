use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use vmfinder_adapters::{AdapterContext, ProviderAdapter};
use vmfinder_core::Provider;
use vmfinder_storage::DatasetStore;

/// Repeating jobs are counted in whole seconds.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// An adapter and the period between its refreshes.
#[derive(Clone)]
pub struct ScheduledAdapter {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Fetching,
    Committing,
}

/// How one refresh cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The provider's records were replaced by `count` fresh ones.
    Committed { count: usize },
    /// The adapter returned nothing; prior data is untouched.
    NoData,
    /// The adapter failed or panicked; prior data is untouched.
    Failed { error: String },
    /// A cycle for the same provider was already running.
    Skipped,
    /// Shutdown began before the result could be committed.
    Abandoned,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Committed { count } => write!(f, "committed {count} records"),
            CycleOutcome::NoData => f.write_str("no data"),
            CycleOutcome::Failed { error } => write!(f, "failed: {error}"),
            CycleOutcome::Skipped => f.write_str("skipped (already running)"),
            CycleOutcome::Abandoned => f.write_str("abandoned (shutting down)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderStatus {
    pub provider: Provider,
    pub interval: Duration,
    pub state: RefreshState,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_outcome: Option<CycleOutcome>,
}

struct ProviderSlot {
    adapter: Arc<dyn ProviderAdapter>,
    interval: Duration,
    /// Held for the whole cycle; at most one cycle per provider.
    in_flight: Mutex<()>,
    status: RwLock<ProviderStatus>,
}

impl ProviderSlot {
    fn update(&self, apply: impl FnOnce(&mut ProviderStatus)) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut status);
    }

    fn snapshot(&self) -> ProviderStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}

struct Inner {
    store: Arc<dyn DatasetStore>,
    slots: Vec<Arc<ProviderSlot>>,
    shutdown: watch::Sender<bool>,
    scheduler: Mutex<Option<JobScheduler>>,
}

/// Owns every adapter, its timer and the dataset they write to.
///
/// Cloning is cheap and yields a handle to the same orchestrator.
#[derive(Clone)]
pub struct RefreshOrchestrator {
    inner: Arc<Inner>,
}

impl RefreshOrchestrator {
    pub fn new(store: Arc<dyn DatasetStore>, adapters: Vec<ScheduledAdapter>) -> Result<Self> {
        let mut slots: Vec<Arc<ProviderSlot>> = Vec::with_capacity(adapters.len());
        for ScheduledAdapter { adapter, interval } in adapters {
            let provider = adapter.provider();
            if interval < MIN_INTERVAL {
                bail!("refresh interval for {provider} must be at least one second");
            }
            if slots.iter().any(|s| s.adapter.provider() == provider) {
                bail!("{provider} registered twice");
            }
            slots.push(Arc::new(ProviderSlot {
                status: RwLock::new(ProviderStatus {
                    provider,
                    interval,
                    state: RefreshState::Idle,
                    last_started: None,
                    last_finished: None,
                    last_outcome: None,
                }),
                adapter,
                interval,
                in_flight: Mutex::new(()),
            }));
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                slots,
                shutdown,
                scheduler: Mutex::new(None),
            }),
        })
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.adapter.provider())
            .collect()
    }

    pub fn store(&self) -> Arc<dyn DatasetStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn status(&self) -> Vec<ProviderStatus> {
        self.inner.slots.iter().map(|slot| slot.snapshot()).collect()
    }

    fn slot(&self, provider: Provider) -> Option<Arc<ProviderSlot>> {
        self.inner
            .slots
            .iter()
            .find(|slot| slot.adapter.provider() == provider)
            .cloned()
    }

    /// Runs one fetch-and-replace cycle for `provider`.
    ///
    /// Never commits an empty batch. Errors and panics inside the adapter become
    /// `Failed` and leave the provider's prior records in place.
    pub async fn run_cycle(&self, provider: Provider) -> CycleOutcome {
        let Some(slot) = self.slot(provider) else {
            warn!(provider = %provider, "no adapter registered");
            return CycleOutcome::Failed {
                error: format!("no adapter registered for {provider}"),
            };
        };

        let Ok(_guard) = slot.in_flight.try_lock() else {
            info!(provider = %provider, "refresh already in flight; skipping");
            return CycleOutcome::Skipped;
        };
        if *self.inner.shutdown.borrow() {
            return CycleOutcome::Abandoned;
        }

        let ctx = AdapterContext::now();
        let span = info_span!("refresh_cycle", provider = %provider, run_id = %ctx.run_id);
        let outcome = self.cycle(&slot, ctx).instrument(span).await;

        slot.update(|status| {
            status.state = RefreshState::Idle;
            status.last_finished = Some(Utc::now());
            status.last_outcome = Some(outcome.clone());
        });
        outcome
    }

    async fn cycle(&self, slot: &ProviderSlot, ctx: AdapterContext) -> CycleOutcome {
        let provider = slot.adapter.provider();
        slot.update(|status| {
            status.state = RefreshState::Fetching;
            status.last_started = Some(ctx.fetched_at);
        });
        info!("refresh started");

        let adapter = Arc::clone(&slot.adapter);
        let mut fetch = tokio::spawn(
            async move { adapter.fetch_data(&ctx).await }.instrument(tracing::Span::current()),
        );
        let mut shutdown = self.inner.shutdown.subscribe();

        let joined = tokio::select! {
            joined = &mut fetch => joined,
            _ = shutdown_signalled(&mut shutdown) => {
                fetch.abort();
                warn!("shutdown during fetch; abandoning cycle");
                return CycleOutcome::Abandoned;
            }
        };

        let records = match joined {
            Ok(Ok(records)) => records,
            Ok(Err(err)) => {
                error!(provider = %provider, error = %err, "refresh failed");
                return CycleOutcome::Failed {
                    error: err.to_string(),
                };
            }
            Err(join_err) => {
                let error = if join_err.is_panic() {
                    "adapter panicked".to_string()
                } else {
                    join_err.to_string()
                };
                error!(provider = %provider, error = %error, "refresh task did not complete");
                return CycleOutcome::Failed { error };
            }
        };

        if records.is_empty() {
            info!(provider = %provider, "no data; keeping previous records");
            return CycleOutcome::NoData;
        }
        if *shutdown.borrow() {
            warn!(
                records = records.len(),
                "shutdown before commit; discarding fetched records"
            );
            return CycleOutcome::Abandoned;
        }

        slot.update(|status| status.state = RefreshState::Committing);
        match self
            .inner
            .store
            .replace_provider_data(provider.display_name(), records)
            .await
        {
            Ok(count) => {
                info!(provider = %provider, count, "replaced provider records");
                CycleOutcome::Committed { count }
            }
            Err(err) => {
                error!(provider = %provider, error = %err, "commit failed; previous records kept");
                CycleOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Runs one cycle for every provider concurrently, in registration order.
    pub async fn refresh_all_now(&self) -> Vec<(Provider, CycleOutcome)> {
        let handles: Vec<_> = self
            .providers()
            .into_iter()
            .map(|provider| {
                let this = self.clone();
                (
                    provider,
                    tokio::spawn(async move { this.run_cycle(provider).await }),
                )
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (provider, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|err| CycleOutcome::Failed {
                error: err.to_string(),
            });
            outcomes.push((provider, outcome));
        }
        outcomes
    }

    /// Arms one repeating timer per provider. Each fire runs on its own task, so a
    /// slow provider never delays another's refresh.
    pub async fn start(&self) -> Result<()> {
        if *self.inner.shutdown.borrow() {
            bail!("orchestrator was stopped");
        }
        let mut scheduler = self.inner.scheduler.lock().await;
        if scheduler.is_some() {
            bail!("orchestrator already started");
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for slot in &self.inner.slots {
            let provider = slot.adapter.provider();
            let this = self.clone();
            let job = Job::new_repeated_async(slot.interval, move |_uuid, _lock| {
                let this = this.clone();
                Box::pin(async move {
                    tokio::spawn(async move {
                        this.run_cycle(provider).await;
                    });
                })
            })
            .with_context(|| format!("creating refresh job for {provider}"))?;
            sched
                .add(job)
                .await
                .with_context(|| format!("adding refresh job for {provider}"))?;
            info!(
                provider = %provider,
                interval_secs = slot.interval.as_secs(),
                "refresh scheduled"
            );
        }
        sched.start().await.context("starting scheduler")?;
        *scheduler = Some(sched);
        Ok(())
    }

    /// Cancels every timer and waits for in-flight cycles to wind down. No commit
    /// happens after this returns.
    pub async fn stop(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        if let Some(mut sched) = self.inner.scheduler.lock().await.take() {
            sched.shutdown().await.context("shutting down scheduler")?;
        }
        for slot in &self.inner.slots {
            let _drained = slot.in_flight.lock().await;
        }
        info!("refresh orchestrator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use vmfinder_adapters::AdapterError;
    use vmfinder_core::VmInstance;
    use vmfinder_storage::MemoryDatasetStore;

    enum Step {
        Records(usize),
        Empty,
        Fail,
        Panic,
        /// Signals `entered`, then waits for `release` before returning records.
        Gated(usize),
    }

    struct ScriptedAdapter {
        provider: Provider,
        script: std::sync::Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    impl ScriptedAdapter {
        fn new(provider: Provider, steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                provider,
                script: std::sync::Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                entered: Notify::new(),
                release: Notify::new(),
            })
        }

        fn batch(&self, n: usize, ctx: &AdapterContext) -> Vec<VmInstance> {
            (0..n)
                .map(|i| VmInstance {
                    instance_name: format!("node-{i}"),
                    provider: self.provider.display_name().to_string(),
                    region: "fsn1".into(),
                    vcpus: 2,
                    memory_gb: Some(4.0),
                    storage_gb: 40,
                    storage_type: "NVMe".into(),
                    hourly_cost: Some(0.01),
                    monthly_cost: Some(7.3),
                    spot_price: None,
                    currency: "EUR".into(),
                    instance_family: "node".into(),
                    network_performance: None,
                    last_updated: ctx.fetched_at,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn fetch_data(
            &self,
            ctx: &AdapterContext,
        ) -> Result<Vec<VmInstance>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Empty);
            match step {
                Step::Records(n) => Ok(self.batch(n, ctx)),
                Step::Empty => Ok(Vec::new()),
                Step::Fail => Err(AdapterError::Message("upstream exploded".into())),
                Step::Panic => panic!("adapter bug"),
                Step::Gated(n) => {
                    self.entered.notify_one();
                    self.release.notified().await;
                    Ok(self.batch(n, ctx))
                }
            }
        }
    }

    const TWELVE_HOURS: Duration = Duration::from_secs(12 * 3600);

    fn orchestrator(
        adapters: &[Arc<ScriptedAdapter>],
    ) -> (RefreshOrchestrator, Arc<MemoryDatasetStore>) {
        orchestrator_every(TWELVE_HOURS, adapters)
    }

    fn orchestrator_every(
        interval: Duration,
        adapters: &[Arc<ScriptedAdapter>],
    ) -> (RefreshOrchestrator, Arc<MemoryDatasetStore>) {
        let store = Arc::new(MemoryDatasetStore::new());
        let scheduled = adapters
            .iter()
            .map(|a| ScheduledAdapter {
                adapter: Arc::clone(a) as Arc<dyn ProviderAdapter>,
                interval,
            })
            .collect();
        let orch = RefreshOrchestrator::new(Arc::clone(&store) as Arc<dyn DatasetStore>, scheduled)
            .unwrap();
        (orch, store)
    }

    async fn count(store: &MemoryDatasetStore, provider: Provider) -> usize {
        store
            .records_for_provider(provider.display_name())
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn commit_replaces_previous_batch() {
        let aws = ScriptedAdapter::new(Provider::Aws, vec![Step::Records(3), Step::Records(2)]);
        let (orch, store) = orchestrator(&[aws]);

        assert_eq!(orch.run_cycle(Provider::Aws).await, CycleOutcome::Committed { count: 3 });
        assert_eq!(orch.run_cycle(Provider::Aws).await, CycleOutcome::Committed { count: 2 });
        assert_eq!(count(&store, Provider::Aws).await, 2);

        let status = &orch.status()[0];
        assert_eq!(status.state, RefreshState::Idle);
        assert_eq!(status.last_outcome, Some(CycleOutcome::Committed { count: 2 }));
        assert!(status.last_finished >= status.last_started);
    }

    #[tokio::test]
    async fn empty_fetch_keeps_prior_records() {
        let cloud =
            ScriptedAdapter::new(Provider::HetznerCloud, vec![Step::Records(4), Step::Empty]);
        let (orch, store) = orchestrator(&[cloud]);

        orch.run_cycle(Provider::HetznerCloud).await;
        assert_eq!(orch.run_cycle(Provider::HetznerCloud).await, CycleOutcome::NoData);
        assert_eq!(count(&store, Provider::HetznerCloud).await, 4);
    }

    #[tokio::test]
    async fn failure_is_isolated_per_provider_and_per_cycle() {
        let aws = ScriptedAdapter::new(
            Provider::Aws,
            vec![Step::Records(2), Step::Fail, Step::Records(5)],
        );
        let robot = ScriptedAdapter::new(
            Provider::HetznerBareMetal,
            vec![Step::Records(1), Step::Records(3)],
        );
        let (orch, store) = orchestrator(&[aws, robot]);

        orch.refresh_all_now().await;
        let outcomes = orch.refresh_all_now().await;
        assert!(matches!(outcomes[0], (Provider::Aws, CycleOutcome::Failed { .. })));
        assert_eq!(
            outcomes[1],
            (Provider::HetznerBareMetal, CycleOutcome::Committed { count: 3 })
        );
        assert_eq!(count(&store, Provider::Aws).await, 2);

        assert_eq!(orch.run_cycle(Provider::Aws).await, CycleOutcome::Committed { count: 5 });
    }

    #[tokio::test]
    async fn panicking_adapter_does_not_poison_later_cycles() {
        let cloud = ScriptedAdapter::new(
            Provider::HetznerCloud,
            vec![Step::Records(2), Step::Panic, Step::Records(1)],
        );
        let (orch, store) = orchestrator(&[cloud]);

        orch.run_cycle(Provider::HetznerCloud).await;
        let outcome = orch.run_cycle(Provider::HetznerCloud).await;
        assert_eq!(
            outcome,
            CycleOutcome::Failed {
                error: "adapter panicked".into()
            }
        );
        assert_eq!(count(&store, Provider::HetznerCloud).await, 2);
        assert_eq!(orch.status()[0].state, RefreshState::Idle);

        assert_eq!(
            orch.run_cycle(Provider::HetznerCloud).await,
            CycleOutcome::Committed { count: 1 }
        );
    }

    #[tokio::test]
    async fn overlapping_fire_for_same_provider_is_skipped() {
        let aws = ScriptedAdapter::new(Provider::Aws, vec![Step::Gated(2), Step::Records(9)]);
        let (orch, store) = orchestrator(&[Arc::clone(&aws)]);

        let first = tokio::spawn({
            let orch = orch.clone();
            async move { orch.run_cycle(Provider::Aws).await }
        });
        aws.entered.notified().await;
        assert_eq!(orch.status()[0].state, RefreshState::Fetching);

        assert_eq!(orch.run_cycle(Provider::Aws).await, CycleOutcome::Skipped);
        assert_eq!(aws.calls.load(Ordering::SeqCst), 1);

        aws.release.notify_one();
        assert_eq!(first.await.unwrap(), CycleOutcome::Committed { count: 2 });
        assert_eq!(count(&store, Provider::Aws).await, 2);
    }

    #[tokio::test]
    async fn stop_abandons_in_flight_cycle() {
        let robot = ScriptedAdapter::new(Provider::HetznerBareMetal, vec![Step::Gated(2)]);
        let (orch, store) = orchestrator(&[Arc::clone(&robot)]);

        let in_flight = tokio::spawn({
            let orch = orch.clone();
            async move { orch.run_cycle(Provider::HetznerBareMetal).await }
        });
        robot.entered.notified().await;

        orch.stop().await.unwrap();
        assert_eq!(in_flight.await.unwrap(), CycleOutcome::Abandoned);
        assert_eq!(count(&store, Provider::HetznerBareMetal).await, 0);
        assert_eq!(
            orch.run_cycle(Provider::HetznerBareMetal).await,
            CycleOutcome::Abandoned
        );
    }

    #[tokio::test]
    async fn unknown_provider_fails_without_side_effects() {
        let (orch, _store) = orchestrator(&[ScriptedAdapter::new(Provider::Aws, vec![])]);
        assert!(matches!(
            orch.run_cycle(Provider::Scaleway).await,
            CycleOutcome::Failed { .. }
        ));
    }

    #[test]
    fn sub_second_interval_is_rejected() {
        let store: Arc<dyn DatasetStore> = Arc::new(MemoryDatasetStore::new());
        let adapter: Arc<dyn ProviderAdapter> = ScriptedAdapter::new(Provider::Aws, vec![]);
        let err = RefreshOrchestrator::new(
            store,
            vec![ScheduledAdapter {
                adapter,
                interval: Duration::from_millis(50),
            }],
        )
        .err()
        .expect("sub-second interval must be rejected");
        assert!(err.to_string().contains("at least one second"));
    }

    #[test]
    fn duplicate_provider_is_rejected() {
        let store: Arc<dyn DatasetStore> = Arc::new(MemoryDatasetStore::new());
        let scheduled = (0..2)
            .map(|_| ScheduledAdapter {
                adapter: ScriptedAdapter::new(Provider::Aws, vec![]),
                interval: TWELVE_HOURS,
            })
            .collect();
        assert!(RefreshOrchestrator::new(store, scheduled).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_then_stop_lifecycle() {
        let (orch, _store) = orchestrator(&[ScriptedAdapter::new(Provider::Aws, vec![])]);
        orch.start().await.unwrap();
        assert!(orch.start().await.is_err());
        orch.stop().await.unwrap();
        assert!(orch.start().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_keeps_firing_both_providers_when_one_always_fails() {
        let failing = ScriptedAdapter::new(Provider::Aws, (0..32).map(|_| Step::Fail).collect());
        let steady = ScriptedAdapter::new(
            Provider::HetznerCloud,
            (1..=32).map(Step::Records).collect(),
        );
        let (orch, store) = orchestrator_every(
            Duration::from_secs(1),
            &[Arc::clone(&failing), Arc::clone(&steady)],
        );

        orch.start().await.unwrap();
        let both_fired_twice = async {
            while failing.calls.load(Ordering::SeqCst) < 2
                || steady.calls.load(Ordering::SeqCst) < 2
            {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), both_fired_twice)
            .await
            .expect("both providers keep firing on their timers");
        let status = orch.status();
        orch.stop().await.unwrap();

        assert!(matches!(
            status[0].last_outcome,
            Some(CycleOutcome::Failed { .. })
        ));
        assert!(matches!(
            status[1].last_outcome,
            Some(CycleOutcome::Committed { .. })
        ));
        assert!(count(&store, Provider::HetznerCloud).await >= 1);
        assert_eq!(count(&store, Provider::Aws).await, 0);
    }
}
