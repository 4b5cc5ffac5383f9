//! Host selection for new instances.
//!
//! Three strategies are available:
//! - resource score: most memory headroom wins
//! - consistent hash: the owner key pins a host among the available set
//! - round robin by count: the host with the fewest bound instances wins
//!
//! [`HostScheduler::select`] is what the creation flow uses. Selection and
//! [`HostScheduler::validate_resources`] read through a short-lived stats
//! cache, and there is no cross-request locking: two concurrent creations can
//! both be admitted against the same stale figures.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::error::{AppError, Result};
use crate::orchestrator::{Host, HostStats, Orchestrator};
use crate::storage::{HostSnapshot, InstanceStore};

use super::quota::{Plan, Quota};

/// Score assigned to hosts that cannot take the requested plan
const DISQUALIFIED: f64 = -1.0;

/// The scheduler's decision for one request. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSelection {
    pub endpoint_id: i64,
    pub host: Host,
    pub stats: Option<HostStats>,
    pub score: f64,
}

/// Outcome of a pre-commit headroom check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ResourceCheck {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Placement used by [`HostScheduler::select`] when no previous host is reused
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    #[default]
    RoundRobin,
    Resources,
    ConsistentHash,
}

impl FromStr for Strategy {
    type Err = AppError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "resources" => Ok(Self::Resources),
            "consistent_hash" => Ok(Self::ConsistentHash),
            other => Err(AppError::InvalidInput(format!(
                "Unknown scheduling strategy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectOptions<'a> {
    pub user_id: &'a str,
    pub plan: Plan,
    /// Reuse the host of the user's existing instance when it still fits
    pub prefer_same_host: bool,
}

/// Operator view of a host
#[derive(Debug, Clone, Serialize)]
pub struct HostOverview {
    #[serde(flatten)]
    pub host: Host,
    pub stats: Option<HostStats>,
    /// When `stats` come from the `host_cache` table rather than a live fetch,
    /// the time they were taken
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_as_of: Option<DateTime<Utc>>,
    pub instance_count: i64,
}

pub struct HostScheduler {
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<InstanceStore>,
    stats_cache: TtlCache<i64, HostStats>,
    strategy: Strategy,
}

impl HostScheduler {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        store: Arc<InstanceStore>,
        stats_ttl: Duration,
    ) -> Self {
        Self {
            orchestrator,
            store,
            stats_cache: TtlCache::new(stats_ttl),
            strategy: Strategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Stats for a host, served from cache when fresh
    pub async fn host_stats(&self, host: &Host) -> Option<HostStats> {
        if let Some(stats) = self.stats_cache.get(&host.endpoint_id) {
            return Some(stats);
        }

        let stats = self.orchestrator.get_host_stats(host.endpoint_id).await?;
        self.stats_cache.insert(host.endpoint_id, stats);
        self.snapshot_host(host, &stats);
        Some(stats)
    }

    /// Drop cached stats so the next selection sees fresh figures
    pub fn forget_stats(&self) {
        let dropped = self.stats_cache.invalidate_all() + self.orchestrator.invalidate_cache(None);
        debug!("Dropped {} cached host entries", dropped);
    }

    /// Record the host in the `host_cache` table. Failures are only logged.
    fn snapshot_host(&self, host: &Host, stats: &HostStats) {
        let instance_count = self.store.count_by_endpoint(host.endpoint_id).unwrap_or(0);
        let snapshot = HostSnapshot {
            endpoint_id: host.endpoint_id,
            name: host.name.clone(),
            status: host.status,
            last_check: Utc::now(),
            cpu_total: stats.cpu_cores,
            memory_total: stats.memory_total,
            memory_used: stats.memory_used,
            instance_count,
        };
        if let Err(e) = self.store.upsert_host(&snapshot) {
            warn!("Failed to cache host {}: {}", host.endpoint_id, e);
        }
    }

    /// Pick the reachable host with the highest resource score
    pub async fn select_by_resources(&self, plan: Plan) -> Result<Option<HostSelection>> {
        let quota = plan.quota();
        let hosts = self.orchestrator.list_available_hosts().await?;
        let mut best: Option<HostSelection> = None;

        for host in hosts {
            let stats = self.host_stats(&host).await;
            let score = stats
                .as_ref()
                .map(|s| resource_score(s, &quota))
                .unwrap_or(DISQUALIFIED);

            debug!("Host {} ({}) scored {:.2}", host.name, host.endpoint_id, score);

            if score < 0.0 {
                continue;
            }
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(HostSelection {
                    endpoint_id: host.endpoint_id,
                    host,
                    stats,
                    score,
                });
            }
        }

        if best.is_none() {
            warn!("No host has {} MB free for plan {}", quota.memory_mb, plan);
        }
        Ok(best)
    }

    /// Pin an owner to a host. Stable while the set of available hosts is unchanged.
    pub async fn select_by_consistent_hash(
        &self,
        tenant_id: Option<&str>,
        user_id: &str,
    ) -> Result<Option<HostSelection>> {
        let hosts = self.orchestrator.list_available_hosts().await?;
        if hosts.is_empty() {
            return Ok(None);
        }

        let key = tenant_id.unwrap_or(user_id);
        let index = hash_index(key, hosts.len());
        let host = hosts[index].clone();

        debug!("Owner key {} hashed to host {}", key, host.endpoint_id);

        Ok(Some(HostSelection {
            endpoint_id: host.endpoint_id,
            host,
            stats: None,
            score: 0.0,
        }))
    }

    /// Pick the reachable host with the fewest bound instances
    pub async fn select_by_round_robin(&self) -> Result<Option<HostSelection>> {
        let hosts = self.orchestrator.list_available_hosts().await?;
        let mut best: Option<(Host, i64)> = None;

        for host in hosts {
            let count = self.store.count_by_endpoint(host.endpoint_id)?;
            debug!("Host {} has {} instance(s)", host.endpoint_id, count);

            if best.as_ref().map_or(true, |(_, fewest)| count < *fewest) {
                best = Some((host, count));
            }
        }

        Ok(best.map(|(host, count)| HostSelection {
            endpoint_id: host.endpoint_id,
            host,
            stats: None,
            score: -(count as f64),
        }))
    }

    /// Host for a new instance: the user's current host if requested and it
    /// still fits, otherwise whatever the configured strategy picks.
    pub async fn select(&self, options: SelectOptions<'_>) -> Result<Option<HostSelection>> {
        if options.prefer_same_host {
            if let Some(selection) = self.existing_binding(options).await? {
                info!(
                    "Reusing host {} for user {}",
                    selection.endpoint_id, options.user_id
                );
                return Ok(Some(selection));
            }
        }

        match self.strategy {
            Strategy::RoundRobin => self.select_by_round_robin().await,
            Strategy::Resources => self.select_by_resources(options.plan).await,
            Strategy::ConsistentHash => {
                self.select_by_consistent_hash(None, options.user_id).await
            }
        }
    }

    async fn existing_binding(&self, options: SelectOptions<'_>) -> Result<Option<HostSelection>> {
        let bound = self
            .store
            .list_by_user(options.user_id)?
            .into_iter()
            .find_map(|i| i.container().map(|c| c.endpoint_id));

        let Some(endpoint_id) = bound else {
            return Ok(None);
        };

        let hosts = self.orchestrator.list_available_hosts().await?;
        let Some(host) = hosts.into_iter().find(|h| h.endpoint_id == endpoint_id) else {
            debug!("Previous host {} is no longer available", endpoint_id);
            return Ok(None);
        };

        let quota = options.plan.quota();
        let Some(stats) = self.host_stats(&host).await else {
            return Ok(None);
        };
        if !check_memory(&stats, &quota).valid {
            debug!("Previous host {} lacks headroom", endpoint_id);
            return Ok(None);
        }

        Ok(Some(HostSelection {
            endpoint_id,
            host,
            stats: Some(stats),
            score: resource_score(&stats, &quota),
        }))
    }

    /// Re-check headroom right before committing a container to a host
    pub async fn validate_resources(&self, endpoint_id: i64, plan: Plan) -> ResourceCheck {
        let stats = match self.stats_cache.get(&endpoint_id) {
            Some(stats) => Some(stats),
            None => {
                let stats = self.orchestrator.get_host_stats(endpoint_id).await;
                if let Some(stats) = stats {
                    self.stats_cache.insert(endpoint_id, stats);
                }
                stats
            }
        };

        match stats {
            Some(stats) => check_memory(&stats, &plan.quota()),
            None => ResourceCheck::rejected("Cannot get host stats"),
        }
    }

    /// Every host with its current stats and bound instance count. Hosts
    /// without live stats fall back to their last cached snapshot.
    pub async fn host_overview(&self) -> Result<Vec<HostOverview>> {
        let hosts = self.orchestrator.list_hosts().await?;
        let mut snapshots: HashMap<i64, HostSnapshot> = self
            .store
            .list_cached_hosts()?
            .into_iter()
            .map(|s| (s.endpoint_id, s))
            .collect();
        let mut overview = Vec::with_capacity(hosts.len());

        for host in hosts {
            let live = if host.is_up() {
                self.host_stats(&host).await
            } else {
                None
            };
            let (stats, stats_as_of) = match live {
                Some(stats) => (Some(stats), None),
                None => match snapshots.remove(&host.endpoint_id) {
                    Some(snapshot) => (
                        Some(HostStats {
                            cpu_cores: snapshot.cpu_total,
                            memory_total: snapshot.memory_total,
                            memory_used: snapshot.memory_used,
                        }),
                        Some(snapshot.last_check),
                    ),
                    None => (None, None),
                },
            };
            let instance_count = self.store.count_by_endpoint(host.endpoint_id)?;
            overview.push(HostOverview {
                host,
                stats,
                stats_as_of,
                instance_count,
            });
        }

        Ok(overview)
    }
}

/// `100 - 0.5 * cpu% - 0.5 * mem%`, or [`DISQUALIFIED`] without enough free memory.
fn resource_score(stats: &HostStats, quota: &Quota) -> f64 {
    if stats.available_memory_gb() < quota.memory_gb() {
        return DISQUALIFIED;
    }

    // TODO: feed real CPU utilisation once host stats carry it; this term
    // currently restates memory usage.
    let cpu_usage_pct = stats.memory_usage_pct();
    let mem_usage_pct = stats.memory_usage_pct();

    100.0 - 0.5 * cpu_usage_pct - 0.5 * mem_usage_pct
}

fn check_memory(stats: &HostStats, quota: &Quota) -> ResourceCheck {
    let available_gb = stats.available_memory_gb();
    let required_gb = quota.memory_gb();

    if available_gb < required_gb {
        ResourceCheck::rejected(format!(
            "Insufficient memory: {:.2} GB available, {:.2} GB required",
            available_gb, required_gb
        ))
    } else {
        ResourceCheck::ok()
    }
}

fn hash_index(key: &str, host_count: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix as usize % host_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::model::{ContainerBinding, Instance, InstanceKind, InstanceStatus};
    use crate::orchestrator::mock::{host, stats_gb, MockOrchestrator};
    use crate::orchestrator::HostStatus;

    fn scheduler(mock: MockOrchestrator) -> (HostScheduler, Arc<MockOrchestrator>, Arc<InstanceStore>) {
        let mock = Arc::new(mock);
        let store = Arc::new(InstanceStore::open_in_memory().unwrap());
        let scheduler = HostScheduler::new(mock.clone(), store.clone(), Duration::from_secs(30));
        (scheduler, mock, store)
    }

    fn bind(store: &InstanceStore, id: &str, user: &str, endpoint_id: i64) {
        let now = Utc::now();
        store
            .insert(&Instance {
                instance_id: id.to_string(),
                user_id: user.to_string(),
                name: id.to_string(),
                owner_email: None,
                plan: Plan::Free,
                url: format!("https://{}.example.test", id),
                status: InstanceStatus::Running,
                kind: InstanceKind::Managed(ContainerBinding {
                    container_id: format!("cid-{}", id),
                    container_name: format!("tenant-{}", id),
                    endpoint_id,
                    port: None,
                    gateway_token: "t".to_string(),
                }),
                created_at: now,
                updated_at: now,
            })
            .unwrap();
    }

    #[test]
    fn test_validate_threshold() {
        let basic = Plan::Basic.quota();
        assert!(check_memory(&stats_gb(2.0, 1.0), &basic).valid);
        assert!(check_memory(&stats_gb(4.0, 1.0), &basic).valid);
        assert!(!check_memory(&stats_gb(1.5, 1.0), &basic).valid);
    }

    #[tokio::test]
    async fn test_validate_rejects_nearly_full_host() {
        let (scheduler, _, _) =
            scheduler(MockOrchestrator::new(vec![host(1, "a")]).with_stats(1, stats_gb(1.0, 0.9)));

        let check = scheduler.validate_resources(1, Plan::Basic).await;
        assert!(!check.valid);
        assert!(check.reason.unwrap().contains("Insufficient memory"));

        let check = scheduler.validate_resources(1, Plan::Free).await;
        assert!(!check.valid);
    }

    #[tokio::test]
    async fn test_validate_without_stats() {
        let (scheduler, _, _) = scheduler(MockOrchestrator::new(vec![host(1, "a")]));
        let check = scheduler.validate_resources(1, Plan::Free).await;
        assert_eq!(check, ResourceCheck::rejected("Cannot get host stats"));
    }

    #[tokio::test]
    async fn test_resource_score_picks_most_headroom() {
        let mock = MockOrchestrator::new(vec![host(1, "a"), host(2, "b"), host(3, "c")])
            .with_stats(1, stats_gb(8.0, 6.0))
            .with_stats(2, stats_gb(8.0, 2.0))
            .with_stats(3, stats_gb(8.0, 7.5));
        let (scheduler, _, _) = scheduler(mock);

        let selection = scheduler
            .select_by_resources(Plan::Basic)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection.endpoint_id, 2);
        assert!((selection.score - 75.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_resource_score_never_picks_underprovisioned_host() {
        let mock = MockOrchestrator::new(vec![host(1, "a"), host(2, "b"), host(3, "c")])
            .with_stats(1, stats_gb(1.0, 0.9))
            .with_stats(3, stats_gb(2.0, 1.5));
        let (scheduler, _, _) = scheduler(mock);

        // host 2 has no stats, the others lack 1 GB free
        assert!(scheduler
            .select_by_resources(Plan::Basic)
            .await
            .unwrap()
            .is_none());

        let selection = scheduler
            .select_by_resources(Plan::Free)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection.endpoint_id, 3);
    }

    #[tokio::test]
    async fn test_resource_score_tie_goes_to_first_host() {
        let mock = MockOrchestrator::new(vec![host(4, "a"), host(5, "b")])
            .with_stats(4, stats_gb(4.0, 1.0))
            .with_stats(5, stats_gb(4.0, 1.0));
        let (scheduler, _, _) = scheduler(mock);

        let selection = scheduler
            .select_by_resources(Plan::Free)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection.endpoint_id, 4);
    }

    #[tokio::test]
    async fn test_down_hosts_are_never_candidates() {
        let mut down = host(1, "down");
        down.status = HostStatus::Down;
        let mock = MockOrchestrator::new(vec![down, host(2, "up")])
            .with_stats(1, stats_gb(64.0, 0.0))
            .with_stats(2, stats_gb(4.0, 3.0));
        let (scheduler, _, _) = scheduler(mock);

        let selection = scheduler
            .select_by_resources(Plan::Free)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection.endpoint_id, 2);
    }

    #[tokio::test]
    async fn test_down_hosts_skipped_by_count_and_hash() {
        let mut down = host(1, "down");
        down.status = HostStatus::Down;
        let (scheduler, _, store) = scheduler(MockOrchestrator::new(vec![down, host(2, "up")]));
        bind(&store, "a", "u1", 2);
        bind(&store, "b", "u2", 2);

        let selection = scheduler.select_by_round_robin().await.unwrap().unwrap();
        assert_eq!(selection.endpoint_id, 2);

        for n in 0..20 {
            let user = format!("user-{}", n);
            let selection = scheduler
                .select_by_consistent_hash(None, &user)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(selection.endpoint_id, 2);
        }
    }

    #[tokio::test]
    async fn test_no_reachable_hosts_selects_nothing() {
        let mut down = host(1, "down");
        down.status = HostStatus::Down;
        let (scheduler, _, _) = scheduler(MockOrchestrator::new(vec![down]));

        assert!(scheduler.select_by_round_robin().await.unwrap().is_none());
        assert!(scheduler
            .select_by_consistent_hash(Some("tenant-a"), "u1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_consistent_hash_is_deterministic() {
        let hosts = vec![host(1, "a"), host(2, "b"), host(3, "c"), host(4, "d")];
        let (scheduler, _, _) = scheduler(MockOrchestrator::new(hosts));

        let first = scheduler
            .select_by_consistent_hash(None, "u1")
            .await
            .unwrap()
            .unwrap();
        for _ in 0..5 {
            let again = scheduler
                .select_by_consistent_hash(None, "u1")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(again.endpoint_id, first.endpoint_id);
        }

        let expected = hash_index("u1", 4);
        assert_eq!(first.endpoint_id, (expected + 1) as i64);

        let by_tenant = scheduler
            .select_by_consistent_hash(Some("acme"), "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_tenant.endpoint_id, (hash_index("acme", 4) + 1) as i64);
    }

    #[tokio::test]
    async fn test_consistent_hash_without_hosts() {
        let (scheduler, _, _) = scheduler(MockOrchestrator::new(vec![]));
        assert!(scheduler
            .select_by_consistent_hash(None, "u1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_round_robin_prefers_fewest_instances() {
        let (scheduler, _, store) =
            scheduler(MockOrchestrator::new(vec![host(1, "a"), host(2, "b")]));
        for i in 0..5 {
            bind(&store, &format!("a{}", i), "u", 1);
        }
        for i in 0..2 {
            bind(&store, &format!("b{}", i), "u", 2);
        }

        let selection = scheduler.select_by_round_robin().await.unwrap().unwrap();
        assert_eq!(selection.endpoint_id, 2);
        assert_eq!(selection.score, -2.0);
    }

    #[tokio::test]
    async fn test_round_robin_tie_goes_to_first_host() {
        let (scheduler, _, store) = scheduler(MockOrchestrator::new(vec![
            host(3, "a"),
            host(1, "b"),
            host(2, "c"),
        ]));
        bind(&store, "x", "u", 3);
        bind(&store, "y", "u", 1);
        bind(&store, "z", "u", 2);

        let selection = scheduler.select_by_round_robin().await.unwrap().unwrap();
        assert_eq!(selection.endpoint_id, 3);
    }

    #[tokio::test]
    async fn test_select_reuses_existing_host_when_it_fits() {
        let mock = MockOrchestrator::new(vec![host(1, "a"), host(2, "b")])
            .with_stats(1, stats_gb(8.0, 1.0))
            .with_stats(2, stats_gb(8.0, 1.0));
        let (scheduler, _, store) = scheduler(mock);
        bind(&store, "mine", "u1", 1);
        bind(&store, "other", "u2", 2);
        bind(&store, "other2", "u2", 2);

        let preferred = SelectOptions {
            user_id: "u1",
            plan: Plan::Free,
            prefer_same_host: true,
        };
        let selection = scheduler.select(preferred).await.unwrap().unwrap();
        assert_eq!(selection.endpoint_id, 1);
        assert!(selection.stats.is_some());

        let fresh_user = SelectOptions {
            user_id: "u3",
            ..preferred
        };
        let selection = scheduler.select(fresh_user).await.unwrap().unwrap();
        assert_eq!(selection.endpoint_id, 1);
    }

    #[tokio::test]
    async fn test_select_falls_back_when_existing_host_is_full() {
        let mock = MockOrchestrator::new(vec![host(1, "a"), host(2, "b")])
            .with_stats(1, stats_gb(1.0, 0.9))
            .with_stats(2, stats_gb(8.0, 1.0));
        let (scheduler, _, store) = scheduler(mock);
        bind(&store, "mine", "u1", 1);

        let selection = scheduler
            .select(SelectOptions {
                user_id: "u1",
                plan: Plan::Free,
                prefer_same_host: true,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection.endpoint_id, 2);
    }

    #[tokio::test]
    async fn test_overview_falls_back_to_cached_snapshot() {
        let mock = MockOrchestrator::new(vec![host(1, "a")]).with_stats(1, stats_gb(4.0, 1.0));
        let (scheduler, mock, _) = scheduler(mock);

        let overview = scheduler.host_overview().await.unwrap();
        assert!(overview[0].stats_as_of.is_none());

        mock.update(|s| {
            s.hosts[0].status = HostStatus::Down;
        });
        let overview = scheduler.host_overview().await.unwrap();
        assert_eq!(overview[0].stats, Some(stats_gb(4.0, 1.0)));
        assert!(overview[0].stats_as_of.is_some());
    }

    #[tokio::test]
    async fn test_configured_strategy_drives_select() {
        let mock = MockOrchestrator::new(vec![host(1, "a"), host(2, "b")])
            .with_stats(1, stats_gb(8.0, 6.0))
            .with_stats(2, stats_gb(8.0, 2.0));
        let (scheduler, _, store) = scheduler(mock);
        bind(&store, "x", "u", 2);
        let options = SelectOptions {
            user_id: "u1",
            plan: Plan::Free,
            prefer_same_host: false,
        };

        let selection = scheduler.select(options).await.unwrap().unwrap();
        assert_eq!(selection.endpoint_id, 1);

        let scheduler = scheduler.with_strategy(Strategy::Resources);
        let selection = scheduler.select(options).await.unwrap().unwrap();
        assert_eq!(selection.endpoint_id, 2);

        assert_eq!("resources".parse::<Strategy>().unwrap(), Strategy::Resources);
        assert!("random".parse::<Strategy>().is_err());
    }

    #[tokio::test]
    async fn test_stats_are_cached_and_snapshotted() {
        let mock = MockOrchestrator::new(vec![host(1, "a")]).with_stats(1, stats_gb(4.0, 1.0));
        let (scheduler, mock, store) = scheduler(mock);

        scheduler.select_by_resources(Plan::Free).await.unwrap();
        scheduler.select_by_resources(Plan::Free).await.unwrap();
        scheduler.validate_resources(1, Plan::Free).await;

        let stats_calls = mock.calls().iter().filter(|c| c.starts_with("stats:")).count();
        assert_eq!(stats_calls, 1);

        let cached = store.list_cached_hosts().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].endpoint_id, 1);

        scheduler.forget_stats();
        scheduler.validate_resources(1, Plan::Free).await;
        let stats_calls = mock.calls().iter().filter(|c| c.starts_with("stats:")).count();
        assert_eq!(stats_calls, 2);
    }
}
