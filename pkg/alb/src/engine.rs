use std::sync::Arc;
use tracing::{debug, error, info, warn};

use pkg_cloud::CloudGateway;
use pkg_metrics::{MetricsRegistry, names};
use pkg_types::ingress::Ingress;

use crate::desired::{DesiredIngressTree, TreeOptions};
use crate::error::{CycleReport, ReconcileError};
use crate::liveness::{Liveness, LivenessTracker};
use crate::load_balancer::LoadBalancer;
use crate::metered::MeteredGateway;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix of every remote resource name and the value of the cluster tag.
    pub cluster_name: String,
    /// Ingress class to serve. Empty serves every Ingress.
    pub ingress_class: String,
    pub vpc_id: Option<String>,
}

impl EngineConfig {
    fn tree_options(&self) -> TreeOptions {
        TreeOptions {
            cluster_name: self.cluster_name.clone(),
            ingress_class: self.ingress_class.clone(),
            vpc_id: self.vpc_id.clone(),
        }
    }
}

/// Drives one load balancer tree per Ingress.
///
/// Each [`Engine::sync`] call is one cycle: mark every tracked tree stale, reconcile the
/// tree of every desired Ingress (creating it if new), then tear down what stayed stale.
/// Cycles must not overlap, which `&mut self` enforces.
pub struct Engine {
    gateway: Arc<dyn CloudGateway>,
    config: EngineConfig,
    tracker: LivenessTracker<LoadBalancer>,
    metrics: Arc<MetricsRegistry>,
}

impl Engine {
    pub fn new(
        gateway: Arc<dyn CloudGateway>,
        config: EngineConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let gateway: Arc<dyn CloudGateway> =
            Arc::new(MeteredGateway::new(gateway, metrics.clone()));
        Self {
            gateway,
            config,
            tracker: LivenessTracker::new(),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Adopt the trees this cluster created in an earlier run. They are tracked without a
    /// liveness verdict, so the first cycle keeps those still backed by an Ingress and
    /// tears down the rest. Returns the number of adopted trees.
    pub async fn resume(&mut self) -> Result<usize, ReconcileError> {
        let managed = self
            .gateway
            .describe_managed(&self.config.cluster_name)
            .await
            .map_err(|e| {
                ReconcileError::remote(
                    "describe_managed",
                    format!("cluster {}", self.config.cluster_name),
                    e,
                )
            })?;

        let mut adopted = 0;
        for tree in managed {
            match LoadBalancer::adopt(self.gateway.clone(), tree) {
                Ok(unit) => {
                    let id = unit.ingress_id.clone();
                    if self.tracker.get(&id).is_some() {
                        warn!("Engine: {} is already tracked, not adopting a second tree", id);
                        continue;
                    }
                    self.tracker.insert_unknown(&id, unit);
                    adopted += 1;
                }
                Err(e) => warn!("Engine: skipping remote tree: {}", e),
            }
        }
        info!(
            "Engine: resumed {} load balancers for cluster {}",
            adopted, self.config.cluster_name
        );
        self.update_gauge();
        Ok(adopted)
    }

    /// Run one reconciliation cycle against `ingresses`.
    pub async fn sync(&mut self, ingresses: &[Ingress]) -> CycleReport {
        let mut report = CycleReport::default();
        let tree = DesiredIngressTree::build(ingresses, &self.config.tree_options());

        self.tracker.mark();

        // An Ingress that turned invalid keeps its existing tree untouched.
        for id in tree.invalid_ids() {
            if self.tracker.touch(id) {
                debug!("Engine: {} is invalid, keeping its current tree", id);
            }
        }
        report.warnings.extend(tree.invalid.iter().cloned());

        for desired in &tree.load_balancers {
            let gateway = self.gateway.clone();
            let unit = self.tracker.visit_with(&desired.ingress_id, || {
                LoadBalancer::new(gateway, &desired.ingress_id)
            });
            unit.merge(desired);
            match unit.reconcile(&mut report).await {
                Ok(()) => report.reconciled.push(desired.ingress_id.clone()),
                Err(e) => {
                    error!("Engine: {} failed: {}", desired.ingress_id, e);
                    report.fail(unit.entity(), e);
                }
            }
        }

        self.sweep(&mut report).await;
        self.tracker.settle();
        self.record(&report);
        info!("Engine: sync cycle finished: {}", report);
        report
    }

    /// Tear down every tree left stale by this cycle. A tree whose teardown fails stays
    /// tracked and is retried next cycle.
    async fn sweep(&mut self, report: &mut CycleReport) {
        for id in self.tracker.stale_ids() {
            let Some(unit) = self.tracker.get_mut(&id) else {
                continue;
            };
            info!("Engine: {} no longer has an Ingress, tearing down", id);
            unit.mark_for_deletion();
            match unit.reconcile(report).await {
                Ok(()) => {
                    self.tracker.remove(&id);
                    report.torn_down.push(id);
                }
                Err(e) => {
                    error!("Engine: teardown of {} failed, will retry: {}", id, e);
                    report.fail(unit.entity(), e);
                }
            }
        }
    }

    fn record(&self, report: &CycleReport) {
        self.metrics.counter_inc(names::SYNC_CYCLES_TOTAL);
        self.metrics
            .counter_add(names::RECONCILE_FAILURES_TOTAL, report.failures.len() as u64);
        self.metrics
            .counter_add(names::LOOKUP_MISSES_TOTAL, report.lookup_misses() as u64);
        self.metrics
            .counter_add(names::TEARDOWNS_TOTAL, report.torn_down.len() as u64);
        self.update_gauge();
    }

    fn update_gauge(&self) {
        self.metrics
            .gauge_set(names::MANAGED_LOAD_BALANCERS, self.tracker.len() as i64);
    }

    /// Ingress identifiers of every tracked tree.
    pub fn tracked(&self) -> Vec<String> {
        self.tracker.ids().map(str::to_string).collect()
    }

    pub fn load_balancer(&self, ingress_id: &str) -> Option<&LoadBalancer> {
        self.tracker.get(ingress_id)
    }

    pub fn liveness(&self, ingress_id: &str) -> Option<Liveness> {
        self.tracker.liveness(ingress_id)
    }
}
