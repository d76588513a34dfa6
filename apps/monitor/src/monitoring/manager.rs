//! The check manager: enumerates eligible check items from the current
//! configuration, drains the queue with a staggered worker pool, and swaps
//! the queue on configuration changes without losing in-flight work.
//!
//! Worker i sleeps i·S ms and then ticks every W·S ms, so the global probe
//! launch rate is 1000/S per second regardless of W; W only bounds how many
//! probes are in flight at once.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Check, CheckType, Config, ConfigSource, Member, Service};
use crate::monitoring::queue::{CheckItem, CheckQueue};
use crate::monitoring::registry::CheckRegistry;
use crate::monitoring::sink::ResultSink;
use crate::monitoring::util::parse_url_for_domain;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct CheckManager {
    queue: CheckQueue,
    registry: Arc<CheckRegistry>,
    sink: Arc<ResultSink>,
    config_source: Arc<dyn ConfigSource>,
    num_workers: usize,
    separation: Duration,
    generation: AtomicU64,
    /// Carry-over of last-run stamps across reloads, keyed by item identity.
    last_runs: Mutex<HashMap<String, DateTime<Utc>>>,
    last_config: Mutex<Config>,
    /// Read-held by workers for the span of one check run; the reconciler
    /// write-acquires it so a queue swap never races an in-flight probe.
    active: RwLock<()>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CheckManager {
    pub fn new(
        config: Config,
        config_source: Arc<dyn ConfigSource>,
        registry: Arc<CheckRegistry>,
        sink: Arc<ResultSink>,
    ) -> Arc<Self> {
        let num_workers = config.local.check_workers.workers();
        let separation = config.local.check_workers.separation();
        Arc::new(Self {
            queue: CheckQueue::new(),
            registry,
            sink,
            config_source,
            num_workers,
            separation,
            generation: AtomicU64::new(1),
            last_runs: Mutex::new(HashMap::new()),
            last_config: Mutex::new(config),
            active: RwLock::new(()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Fill the queue from the current configuration and spawn the worker
    /// pool plus the reconciler.
    pub async fn start(self: &Arc<Self>) {
        info!(
            workers = self.num_workers,
            separation_ms = self.separation.as_millis() as u64,
            "Starting check manager"
        );

        let config = self.last_config.lock().await.clone();
        self.rebuild_queue(&config).await;

        let mut tasks = self.tasks.lock().await;
        for worker_id in 0..self.num_workers {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move { manager.worker_loop(worker_id).await }));
        }
        let manager = Arc::clone(self);
        tasks.push(tokio::spawn(async move { manager.reconcile_loop().await }));
    }

    /// Request shutdown and wait briefly for workers to notice. Probes in
    /// flight are not cancelled; timeouts bound their latency.
    pub async fn stop(&self) {
        info!("Stopping check manager");
        self.shutdown.cancel();
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles)).await.is_err() {
            warn!("Timed out waiting for check workers to stop");
        }
        info!("Check manager stopped");
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    async fn worker_loop(&self, worker_id: usize) {
        let start_delay = self.separation * worker_id as u32;
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(start_delay) => {}
        }

        let tick = self.separation * self.num_workers as u32;
        debug!(worker = worker_id, tick_ms = tick.as_millis() as u64, "Worker started");

        // The first tick completes immediately, so each worker runs one
        // check right after its initial delay.
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => self.run_ready_check(worker_id).await,
            }
        }
    }

    /// Pop at most one due item, run it, stamp it, and re-insert it unless a
    /// reload invalidated its generation in the meantime.
    async fn run_ready_check(&self, worker_id: usize) {
        let _active = self.active.read().await;

        let generation = self.generation.load(Ordering::Acquire);
        let Some(mut item) = self.queue.get_next(generation).await else {
            return;
        };

        self.execute_check(worker_id, &item).await;

        let now = Utc::now();
        item.last_executed = Some(now);
        self.last_runs.lock().await.insert(item.identity(), now);

        if item.generation == self.generation.load(Ordering::Acquire) {
            self.queue.add(item).await;
        }
    }

    /// Dispatch on a separate task so a panicking probe is confined to that
    /// run instead of taking the worker down.
    async fn execute_check(&self, worker_id: usize, item: &CheckItem) {
        let registry = Arc::clone(&self.registry);
        let sink = Arc::clone(&self.sink);
        let task_item = item.clone();
        let handle =
            tokio::spawn(async move { dispatch_check(&registry, &sink, &task_item).await });
        if let Err(join_error) = handle.await {
            if join_error.is_panic() {
                error!(
                    worker = worker_id,
                    check = %item.check.name,
                    member = %item.member.details.name,
                    "Check panicked: {join_error}"
                );
            }
        }
    }

    async fn reconcile_loop(&self) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        // The queue was built just before the workers started; skip the
        // interval's immediate first tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => self.reconcile().await,
            }
        }
    }

    /// Reload the configuration and, when it differs structurally from the
    /// last applied snapshot, rebuild the queue under a new generation.
    pub async fn reconcile(&self) {
        let new_config = match self.config_source.load() {
            Ok(config) => config,
            Err(error) => {
                warn!(%error, "Configuration reload failed, keeping current check set");
                return;
            }
        };
        {
            let last = self.last_config.lock().await;
            if *last == new_config {
                return;
            }
        }

        // Let in-flight checks finish so their last-run stamps survive.
        let _guard = self.active.write().await;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(generation, "Configuration changed, rebuilding check queue");

        self.queue.clear().await;
        self.rebuild_queue(&new_config).await;

        *self.last_config.lock().await = new_config;
    }

    /// Enumerate eligible items for the current generation, restore their
    /// last-run stamps by identity, and prune stamps for identities that no
    /// longer exist.
    async fn rebuild_queue(&self, config: &Config) {
        let generation = self.generation.load(Ordering::Acquire);
        let mut items = enumerate_check_items(config, &self.registry, generation);

        {
            let last_runs = self.last_runs.lock().await;
            for item in &mut items {
                if let Some(stamp) = last_runs.get(&item.identity()) {
                    item.last_executed = Some(*stamp);
                }
            }
        }

        let live: HashSet<String> = items.iter().map(CheckItem::identity).collect();
        self.last_runs.lock().await.retain(|identity, _| live.contains(identity));

        let count = items.len();
        for item in items {
            self.queue.add(item).await;
        }
        info!(checks = count, generation, "Initialized checks in queue");
    }
}

async fn dispatch_check(registry: &CheckRegistry, sink: &ResultSink, item: &CheckItem) {
    match item.check_type {
        CheckType::Site => {
            if let Some(probe) = registry.site_check(&item.check.name) {
                probe.run(sink, &item.check, &item.member).await;
            }
        }
        CheckType::Domain => {
            if let (Some(probe), Some(service)) =
                (registry.domain_check(&item.check.name), item.service.as_ref())
            {
                probe.run(sink, &item.check, &item.domain, service, &item.member).await;
            }
        }
        CheckType::Endpoint => {
            if let (Some(probe), Some(service)) =
                (registry.endpoint_check(&item.check.name), item.service.as_ref())
            {
                probe.run(sink, &item.check, &item.endpoint, service, &item.member).await;
            }
        }
    }
}

/// Build one `CheckItem` per (enabled check × eligible member × eligible
/// target) under the given generation. Items start with no last-run stamp;
/// the manager restores stamps from the carry-over map afterwards.
pub fn enumerate_check_items(
    config: &Config,
    registry: &CheckRegistry,
    generation: u64,
) -> Vec<CheckItem> {
    let mut items = Vec::new();
    for check in &config.local.checks {
        if check.enabled != 1 {
            continue;
        }
        match check.check_type {
            CheckType::Site => enumerate_site_items(config, check, generation, &mut items),
            CheckType::Domain => {
                enumerate_domain_items(config, registry, check, generation, &mut items)
            }
            CheckType::Endpoint => {
                enumerate_endpoint_items(config, registry, check, generation, &mut items)
            }
        }
    }
    items
}

fn new_item(
    check: &Check,
    member: &Member,
    service: Option<&Service>,
    domain: String,
    endpoint: String,
    generation: u64,
) -> CheckItem {
    CheckItem {
        check_type: check.check_type,
        check: check.clone(),
        member: member.clone(),
        service: service.cloned(),
        domain,
        endpoint,
        last_executed: None,
        minimum_interval: chrono::Duration::seconds(check.minimum_interval as i64),
        generation,
    }
}

fn enumerate_site_items(config: &Config, check: &Check, generation: u64, items: &mut Vec<CheckItem>) {
    for member in &config.members {
        if !member.is_eligible() {
            continue;
        }
        items.push(new_item(check, member, None, String::new(), String::new(), generation));
    }
}

/// A member serves a service when it is eligible, meets the required tier
/// and has opted into the service.
fn member_serves(member: &Member, service_name: &str, service: &Service) -> bool {
    member.is_eligible()
        && member.membership.level >= service.configuration.level_required
        && member.assigned_to_service(service_name)
}

fn enumerate_domain_items(
    config: &Config,
    registry: &CheckRegistry,
    check: &Check,
    generation: u64,
    items: &mut Vec<CheckItem>,
) {
    for (service_name, service) in &config.services {
        if !registry.is_valid_for_service_type(
            &check.name,
            CheckType::Domain,
            &service.configuration.service_type,
        ) {
            continue;
        }
        let domains = extract_domains(service);
        for member in &config.members {
            if !member_serves(member, service_name, service) {
                continue;
            }
            for domain in &domains {
                items.push(new_item(
                    check,
                    member,
                    Some(service),
                    domain.clone(),
                    String::new(),
                    generation,
                ));
            }
        }
    }
}

fn enumerate_endpoint_items(
    config: &Config,
    registry: &CheckRegistry,
    check: &Check,
    generation: u64,
    items: &mut Vec<CheckItem>,
) {
    for (service_name, service) in &config.services {
        if !registry.is_valid_for_service_type(
            &check.name,
            CheckType::Endpoint,
            &service.configuration.service_type,
        ) {
            continue;
        }
        for member in &config.members {
            if !member_serves(member, service_name, service) {
                continue;
            }
            for provider in &service.providers {
                for rpc_url in &provider.rpc_urls {
                    items.push(new_item(
                        check,
                        member,
                        Some(service),
                        parse_url_for_domain(rpc_url),
                        rpc_url.clone(),
                        generation,
                    ));
                }
            }
        }
    }
}

/// Distinct fronting hostnames across all of a service's provider URLs.
fn extract_domains(service: &Service) -> BTreeSet<String> {
    service
        .providers
        .iter()
        .flat_map(|provider| provider.rpc_urls.iter())
        .filter_map(|rpc_url| {
            let domain = parse_url_for_domain(rpc_url);
            (!domain.is_empty()).then_some(domain)
        })
        .collect()
}
