use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use pkg_cloud::model::{
    CreateLoadBalancerInput, LoadBalancerDescription, ManagedLoadBalancer, tag_value,
};
use pkg_cloud::CloudGateway;
use pkg_constants::alb::{FIRST_RULE_PRIORITY, TAG_INGRESS_NAME, TAG_SERVICE_NAME};

use crate::desired::DesiredLoadBalancer;
use crate::error::{CycleReport, ReconcileError};
use crate::listener::{Listener, ListenerScope};
use crate::target_group::{TargetGroup, TargetGroupSet};

/// The reconciliation unit of one Ingress: a load balancer, its target groups and its
/// listeners.
pub struct LoadBalancer {
    gateway: Arc<dyn CloudGateway>,
    pub ingress_id: String,
    pub current: Option<LoadBalancerDescription>,
    pub desired: Option<LoadBalancerDescription>,
    pub listeners: Vec<Listener>,
    pub target_groups: TargetGroupSet,
    /// Next priority handed to a created rule. Shared by all listeners.
    last_rule_priority: i64,
    deleted: bool,
}

impl LoadBalancer {
    pub fn new(gateway: Arc<dyn CloudGateway>, ingress_id: &str) -> Self {
        Self {
            gateway,
            ingress_id: ingress_id.to_string(),
            current: None,
            desired: None,
            listeners: Vec::new(),
            target_groups: TargetGroupSet::new(),
            last_rule_priority: FIRST_RULE_PRIORITY,
            deleted: false,
        }
    }

    /// Rebuild a unit from a remote tree. The owning Ingress is read from the tags;
    /// rule priorities resume after the highest one in use.
    pub fn adopt(
        gateway: Arc<dyn CloudGateway>,
        managed: ManagedLoadBalancer,
    ) -> Result<Self, ReconcileError> {
        let Some(ingress_id) = tag_value(&managed.load_balancer.tags, TAG_INGRESS_NAME)
            .map(str::to_string)
        else {
            return Err(ReconcileError::invariant(
                format!("load balancer {}", managed.load_balancer.name),
                "missing ingress tag",
            ));
        };

        let mut unit = Self::new(gateway.clone(), &ingress_id);
        let mut services = HashMap::new();
        for tg in managed.target_groups {
            let Some(svc) = tag_value(&tg.tags, TAG_SERVICE_NAME).map(str::to_string) else {
                warn!(
                    "LoadBalancer {}: target group {} has no service tag, not adopting",
                    ingress_id, tg.name
                );
                continue;
            };
            if let Some(arn) = &tg.target_group_arn {
                services.insert(arn.clone(), svc.clone());
            }
            let group = TargetGroup::adopt(gateway.clone(), &ingress_id, &svc, tg);
            if let Err(e) = unit.target_groups.push(group) {
                warn!("LoadBalancer {}: {}", ingress_id, e);
            }
        }

        unit.listeners = managed
            .listeners
            .into_iter()
            .map(|l| Listener::adopt(gateway.clone(), &ingress_id, l, &services))
            .collect();
        let highest = unit
            .listeners
            .iter()
            .flat_map(|l| l.rules.iter())
            .filter(|r| !r.is_default())
            .filter_map(|r| r.priority())
            .max();
        unit.last_rule_priority = highest.map_or(FIRST_RULE_PRIORITY, |p| p + 1);
        unit.current = Some(managed.load_balancer);

        info!(
            "LoadBalancer {}: adopted {} listeners and {} target groups, next rule priority {}",
            ingress_id,
            unit.listeners.len(),
            unit.target_groups.len(),
            unit.last_rule_priority
        );
        Ok(unit)
    }

    pub fn arn(&self) -> Option<&str> {
        self.current
            .as_ref()
            .and_then(|c| c.load_balancer_arn.as_deref())
    }

    pub fn dns_name(&self) -> Option<&str> {
        self.current.as_ref().and_then(|c| c.dns_name.as_deref())
    }

    pub fn last_rule_priority(&self) -> i64 {
        self.last_rule_priority
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn entity(&self) -> String {
        format!("load-balancer {}", self.ingress_id)
    }

    pub fn listener(&self, port: u16) -> Option<&Listener> {
        self.listeners
            .iter()
            .find(|l| !l.is_deleted() && l.port() == Some(port))
    }

    /// Take over the desired tree of this cycle. Listeners are matched by port and target
    /// groups by service; anything left unmatched loses its desired state. Entities
    /// deleted in an earlier cycle are dropped here.
    pub fn merge(&mut self, desired: &DesiredLoadBalancer) {
        self.desired = Some(desired.description.clone());

        self.listeners.retain(|l| !l.is_deleted());
        let mut wanted: Vec<_> = desired.listeners.iter().collect();
        for listener in self.listeners.iter_mut() {
            match wanted
                .iter()
                .position(|d| Some(d.description.port) == listener.port())
            {
                Some(i) => listener.merge(wanted.remove(i)),
                None => listener.mark_for_deletion(),
            }
        }
        for d in wanted {
            self.listeners
                .push(Listener::new(self.gateway.clone(), &self.ingress_id, d));
        }

        // A group a kept listener still forwards unmatched traffic to cannot be deleted
        // before the listener is; keep it around with its current attributes.
        let bound: HashSet<String> = self
            .listeners
            .iter()
            .filter(|l| l.desired.is_some())
            .flat_map(|l| l.default_targets())
            .map(str::to_string)
            .collect();

        self.target_groups.prune_deleted();
        let mut wanted: Vec<_> = desired.target_groups.iter().collect();
        for group in self.target_groups.iter_mut() {
            match wanted.iter().position(|d| d.svc_name == group.svc_name) {
                Some(i) => {
                    let d = wanted.remove(i);
                    group.desired = Some(d.description.clone());
                }
                None if group.arn().is_some_and(|arn| bound.contains(arn)) => {
                    debug!(
                        "LoadBalancer {}: keeping target group of {} for a listener default",
                        self.ingress_id, group.svc_name
                    );
                    group.desired = group.current.clone();
                }
                None => group.desired = None,
            }
        }
        for d in wanted {
            let group = TargetGroup::new(
                self.gateway.clone(),
                &self.ingress_id,
                &d.svc_name,
                d.description.clone(),
            );
            if let Err(e) = self.target_groups.push(group) {
                warn!("LoadBalancer {}: {}", self.ingress_id, e);
            }
        }
    }

    /// Drop the desired state of the whole tree.
    pub fn mark_for_deletion(&mut self) {
        self.desired = None;
        for listener in self.listeners.iter_mut() {
            listener.mark_for_deletion();
        }
        for group in self.target_groups.iter_mut() {
            group.desired = None;
        }
    }

    /// Converge the tree: load balancer, new target groups, listeners with their rules,
    /// then target groups nobody asks for anymore. Failures below the load balancer are
    /// recorded in `report`; an error is returned only when the unit as a whole could not
    /// be processed.
    pub async fn reconcile(&mut self, report: &mut CycleReport) -> Result<(), ReconcileError> {
        if self.desired.is_none() {
            return self.delete().await;
        }
        if self.current.is_none() {
            self.create().await?;
        } else {
            debug!("LoadBalancer {}: no modification required", self.ingress_id);
        }

        for group in self.target_groups.iter_mut().filter(|g| g.desired.is_some()) {
            if let Err(e) = group.reconcile().await {
                report.fail(group.entity(), e);
            }
        }

        let load_balancer_arn = self
            .current
            .as_ref()
            .and_then(|c| c.load_balancer_arn.as_deref());
        for listener in self.listeners.iter_mut() {
            let mut scope = ListenerScope {
                load_balancer_arn,
                target_groups: &self.target_groups,
                last_rule_priority: &mut self.last_rule_priority,
                report: &mut *report,
            };
            if let Err(e) = listener.reconcile(&mut scope).await {
                report.fail(listener.entity(), e);
            }
        }

        for group in self.target_groups.iter_mut().filter(|g| g.desired.is_none()) {
            if let Err(e) = group.reconcile().await {
                report.fail(group.entity(), e);
            }
        }
        Ok(())
    }

    async fn create(&mut self) -> Result<(), ReconcileError> {
        let Some(desired) = self.desired.as_ref() else {
            return Ok(());
        };
        let input = CreateLoadBalancerInput {
            name: desired.name.clone(),
            scheme: desired.scheme.clone(),
            subnets: desired.subnets.clone(),
            security_groups: desired.security_groups.clone(),
            tags: desired.tags.clone(),
        };
        match self.gateway.create_load_balancer(input).await {
            Ok(created) => {
                info!(
                    "LoadBalancer {}: created {} ({})",
                    self.ingress_id,
                    created.name,
                    created.dns_name.as_deref().unwrap_or("no dns name")
                );
                self.current = Some(created);
                self.deleted = false;
                Ok(())
            }
            Err(e) => {
                error!("LoadBalancer {}: failed to create: {}", self.ingress_id, e);
                Err(ReconcileError::remote("create_load_balancer", self.entity(), e))
            }
        }
    }

    /// Tear the tree down: listeners (with their rules), then target groups, then the
    /// load balancer. Stops at the first failure so the next attempt resumes where this
    /// one left off.
    pub async fn delete(&mut self) -> Result<(), ReconcileError> {
        self.mark_for_deletion();
        for listener in self.listeners.iter_mut().filter(|l| !l.is_deleted()) {
            listener.delete().await?;
        }
        for group in self.target_groups.iter_mut().filter(|g| !g.is_deleted()) {
            group.reconcile().await?;
        }

        if let Some(arn) = self.arn().map(str::to_string) {
            match self.gateway.delete_load_balancer(&arn).await {
                Ok(()) => info!("LoadBalancer {}: deleted {}", self.ingress_id, arn),
                Err(e) if e.is_not_found() => {
                    debug!("LoadBalancer {}: {} already gone", self.ingress_id, arn);
                }
                Err(e) => {
                    error!(
                        "LoadBalancer {}: failed to delete {}: {}",
                        self.ingress_id, arn, e
                    );
                    return Err(ReconcileError::remote("delete_load_balancer", self.entity(), e));
                }
            }
        }
        self.current = None;
        self.deleted = true;
        Ok(())
    }
}
