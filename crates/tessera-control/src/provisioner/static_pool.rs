//! Provisioner handing out slots on a fixed pool of runtimes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{ControlError, ControlResult};
use crate::store::Store;
use crate::types::DeploymentId;

use super::probe::{await_reachable, ProbeConfig};
use super::{Allocation, ProvisionOptions, Provisioner};

/// Utilisation above which the capacity check warns.
const CAPACITY_WARN_RATIO: f64 = 0.8;

/// Configuration of a static provisioner.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticSpec {
    pub runtimes: Vec<StaticRuntime>,

    #[serde(default)]
    pub probe: ProbeConfig,
}

/// One preconfigured runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticRuntime {
    pub host: String,
    /// Token audience; defaults to the host.
    #[serde(default)]
    pub audience: Option<String>,
    /// Slot capacity.
    pub slots: u32,
}

impl StaticRuntime {
    fn audience(&self) -> &str {
        self.audience.as_deref().unwrap_or(&self.host)
    }
}

/// Slots handed out by [`StaticProvisioner::provision`].
#[derive(Debug, Clone)]
struct Reservation {
    host: String,
    slots: u32,
    /// Set once the deployment record exists and the store counts it.
    recorded: bool,
}

/// Static provisioner.
///
/// Slot usage is derived from the deployments recorded in the store, so a
/// deployment occupies its slots until its record is deleted. Slots handed
/// out but not yet recorded are held as reservations.
pub struct StaticProvisioner {
    spec: StaticSpec,
    store: Arc<dyn Store>,
    reservations: DashMap<String, Reservation>,
    /// Serialises choosing a runtime with taking the reservation.
    placing: Mutex<()>,
    http: reqwest::Client,
}

impl StaticProvisioner {
    /// Create a provisioner over the configured runtimes.
    pub fn new(spec: StaticSpec, store: Arc<dyn Store>) -> ControlResult<Self> {
        if spec.runtimes.is_empty() {
            return Err(ControlError::Config(
                "static provisioner needs at least one runtime".to_owned(),
            ));
        }
        Ok(Self {
            spec,
            store,
            reservations: DashMap::new(),
            placing: Mutex::new(()),
            http: reqwest::Client::new(),
        })
    }

    /// Mark reservations whose deployment has since been recorded.
    ///
    /// Runs before the usage snapshot is read, so a reservation is counted
    /// at least once.
    async fn refresh_reservations(&self) -> ControlResult<()> {
        let pending: Vec<String> = self
            .reservations
            .iter()
            .filter(|entry| !entry.recorded)
            .map(|entry| entry.key().clone())
            .collect();

        for id in pending {
            match self.store.find_deployment(&DeploymentId::new(id.clone())).await {
                Ok(_) => {
                    if let Some(mut reservation) = self.reservations.get_mut(&id) {
                        reservation.recorded = true;
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn recorded_usage(&self) -> ControlResult<HashMap<String, u32>> {
        self.refresh_reservations().await?;
        self.store.runtime_slots_used().await
    }

    /// `(runtime, free slots)` for every configured runtime.
    fn free_slots(&self, recorded: &HashMap<String, u32>) -> Vec<(&StaticRuntime, u32)> {
        self.spec
            .runtimes
            .iter()
            .map(|rt| {
                let pending = self
                    .reservations
                    .iter()
                    .filter(|entry| !entry.recorded && entry.host == rt.host)
                    .fold(0u32, |sum, entry| sum.saturating_add(entry.slots));
                let used = recorded
                    .get(&rt.host)
                    .copied()
                    .unwrap_or(0)
                    .saturating_add(pending);
                (rt, rt.slots.saturating_sub(used))
            })
            .collect()
    }

    fn place(
        &self,
        opts: &ProvisionOptions,
        recorded: &HashMap<String, u32>,
    ) -> ControlResult<(&StaticRuntime, u32)> {
        let _placing = self
            .placing
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        self.reservations.remove(&opts.provision_id);

        let (runtime, free) = self
            .free_slots(recorded)
            .into_iter()
            .filter(|(_, free)| *free >= opts.slots)
            .max_by_key(|(_, free)| *free)
            .ok_or_else(|| {
                ControlError::provisioning(format!(
                    "no runtime has {} free slots",
                    opts.slots
                ))
            })?;

        self.reservations.insert(
            opts.provision_id.clone(),
            Reservation {
                host: runtime.host.clone(),
                slots: opts.slots,
                recorded: false,
            },
        );
        Ok((runtime, free))
    }
}

impl std::fmt::Debug for StaticProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticProvisioner")
            .field("runtimes", &self.spec.runtimes)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    fn kind(&self) -> &'static str {
        "static"
    }

    async fn provision(&self, opts: &ProvisionOptions) -> ControlResult<Allocation> {
        let recorded = self.recorded_usage().await?;
        let (runtime, free) = self.place(opts, &recorded)?;

        info!(
            provision_id = %opts.provision_id,
            host = %runtime.host,
            free,
            "assigned runtime"
        );
        Ok(Allocation::for_slots(
            runtime.host.clone(),
            runtime.audience(),
            opts.slots,
        ))
    }

    async fn deprovision(&self, provision_id: &str) -> ControlResult<()> {
        self.reservations.remove(provision_id);
        Ok(())
    }

    async fn await_ready(&self, provision_id: &str) -> ControlResult<()> {
        let host = self
            .reservations
            .get(provision_id)
            .map(|entry| entry.host.clone())
            .ok_or_else(|| {
                ControlError::provisioning(format!("unknown provision id {provision_id}"))
            })?;
        await_reachable(&self.http, &host, &self.spec.probe).await
    }

    async fn update(&self, _provision_id: &str, _runtime_version: &str) -> ControlResult<()> {
        Ok(())
    }

    async fn check_capacity(&self) -> ControlResult<()> {
        let recorded = self.recorded_usage().await?;
        let slots = self.free_slots(&recorded);
        let total: u64 = slots.iter().map(|(rt, _)| u64::from(rt.slots)).sum();
        let free: u64 = slots.iter().map(|(_, free)| u64::from(*free)).sum();

        if free == 0 {
            return Err(ControlError::provisioning(
                "all static runtimes are at capacity",
            ));
        }

        #[allow(clippy::as_conversions)]
        let utilisation = 1.0 - free as f64 / total as f64;
        if utilisation > CAPACITY_WARN_RATIO {
            warn!(total, free, "static runtimes above 80% capacity");
        }
        Ok(())
    }

    async fn validate_config(&self, _provision_id: &str) -> ControlResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{
        CreateProjectOptions, Deployment, DeploymentId, Organization, Project, RuntimeEndpoint,
    };

    fn spec() -> StaticSpec {
        StaticSpec {
            runtimes: vec![
                StaticRuntime {
                    host: "http://rt-1".to_owned(),
                    audience: None,
                    slots: 4,
                },
                StaticRuntime {
                    host: "http://rt-2".to_owned(),
                    audience: Some("rt-2".to_owned()),
                    slots: 6,
                },
            ],
            probe: ProbeConfig::default(),
        }
    }

    fn opts(id: &str, slots: u32) -> ProvisionOptions {
        ProvisionOptions {
            provision_id: id.to_owned(),
            slots,
            ..ProvisionOptions::default()
        }
    }

    async fn occupy(store: &MemoryStore, host: &str, slots: u32) {
        occupy_as(store, DeploymentId::generate(), host, slots).await;
    }

    async fn occupy_as(store: &MemoryStore, id: DeploymentId, host: &str, slots: u32) {
        let org = Organization::new(format!("org-{}", DeploymentId::generate()), None);
        store.insert_organization(&org).await.expect("insert failed");
        let project = Project::new(
            org.id.clone(),
            CreateProjectOptions {
                name: "p".to_owned(),
                prod_slots: slots,
                ..CreateProjectOptions::default()
            },
            "pool",
        );
        store.create_project(&project, &[]).await.expect("create failed");
        let deployment = Deployment::pending(
            id,
            &project,
            RuntimeEndpoint {
                host: host.to_owned(),
                instance_id: "i".to_owned(),
                audience: host.to_owned(),
            },
        );
        store
            .insert_deployment(&deployment)
            .await
            .expect("insert failed");
    }

    #[test]
    fn rejects_empty_pool() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let spec = StaticSpec {
            runtimes: vec![],
            probe: ProbeConfig::default(),
        };
        assert!(StaticProvisioner::new(spec, store).is_err());
    }

    #[tokio::test]
    async fn assigns_runtime_with_most_free_slots() {
        let store = Arc::new(MemoryStore::new());
        occupy(&store, "http://rt-2", 5).await;
        let provisioner =
            StaticProvisioner::new(spec(), Arc::clone(&store) as Arc<dyn Store>).expect("new failed");

        let allocation = provisioner.provision(&opts("a", 2)).await.expect("provision failed");
        assert_eq!(allocation.host, "http://rt-1");
        assert_eq!(allocation.audience, "http://rt-1");
        assert_eq!(allocation.cpu, 2);
    }

    #[tokio::test]
    async fn fails_when_nothing_fits() {
        let store = Arc::new(MemoryStore::new());
        let provisioner =
            StaticProvisioner::new(spec(), Arc::clone(&store) as Arc<dyn Store>).expect("new failed");

        assert!(provisioner.provision(&opts("a", 7)).await.is_err());
    }

    #[tokio::test]
    async fn capacity_check_fails_when_full() {
        let store = Arc::new(MemoryStore::new());
        let provisioner =
            StaticProvisioner::new(spec(), Arc::clone(&store) as Arc<dyn Store>).expect("new failed");
        provisioner.check_capacity().await.expect("capacity failed");

        occupy(&store, "http://rt-1", 4).await;
        occupy(&store, "http://rt-2", 6).await;
        assert!(provisioner.check_capacity().await.is_err());
    }

    #[tokio::test]
    async fn await_ready_requires_assignment() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let provisioner = StaticProvisioner::new(spec(), store).expect("new failed");
        assert!(provisioner.await_ready("never").await.is_err());
        assert!(provisioner.validate_config("never").await.expect("validate failed"));
    }

    #[tokio::test]
    async fn unrecorded_assignments_hold_their_slots() {
        let store = Arc::new(MemoryStore::new());
        let provisioner =
            StaticProvisioner::new(spec(), Arc::clone(&store) as Arc<dyn Store>).expect("new failed");

        let first = provisioner.provision(&opts("a", 6)).await.expect("provision failed");
        assert_eq!(first.host, "http://rt-2");
        let second = provisioner.provision(&opts("b", 4)).await.expect("provision failed");
        assert_eq!(second.host, "http://rt-1");
        assert!(provisioner.provision(&opts("c", 1)).await.is_err());
        assert!(provisioner.check_capacity().await.is_err());

        provisioner.deprovision("b").await.expect("deprovision failed");
        let third = provisioner.provision(&opts("c", 1)).await.expect("provision failed");
        assert_eq!(third.host, "http://rt-1");
    }

    #[tokio::test]
    async fn recorded_assignments_are_counted_once() {
        let store = Arc::new(MemoryStore::new());
        let provisioner =
            StaticProvisioner::new(spec(), Arc::clone(&store) as Arc<dyn Store>).expect("new failed");

        let id = DeploymentId::generate();
        let allocation = provisioner
            .provision(&opts(id.as_str(), 2))
            .await
            .expect("provision failed");
        assert_eq!(allocation.host, "http://rt-2");
        occupy_as(&store, id, "http://rt-2", 2).await;

        // rt-2 has 4 free, not 2.
        provisioner.provision(&opts("b", 4)).await.expect("provision failed");
        provisioner.provision(&opts("c", 4)).await.expect("provision failed");
        assert!(provisioner.provision(&opts("d", 1)).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_provisions_do_not_oversubscribe() {
        let store = Arc::new(MemoryStore::new());
        let provisioner = Arc::new(
            StaticProvisioner::new(spec(), Arc::clone(&store) as Arc<dyn Store>)
                .expect("new failed"),
        );

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..4 {
            let provisioner = Arc::clone(&provisioner);
            tasks.spawn(async move { provisioner.provision(&opts(&format!("p{i}"), 3)).await });
        }
        let mut placed = 0;
        while let Some(result) = tasks.join_next().await {
            if result.expect("task panicked").is_ok() {
                placed += 1;
            }
        }

        // 4 + 6 slots fit three deployments of 3.
        assert_eq!(placed, 3);
    }
}
