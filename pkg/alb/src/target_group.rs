use std::sync::Arc;
use tracing::{debug, error, info};

use pkg_cloud::model::{CreateTargetGroupInput, TargetGroupDescription};
use pkg_cloud::CloudGateway;

use crate::error::ReconcileError;

/// A target group fronting one backend service of a load balancer.
pub struct TargetGroup {
    gateway: Arc<dyn CloudGateway>,
    pub ingress_id: String,
    pub svc_name: String,
    /// Remote snapshot. `None` until created, and again once deleted.
    pub current: Option<TargetGroupDescription>,
    /// `None` when no rule or listener of the load balancer needs the service anymore.
    pub desired: Option<TargetGroupDescription>,
    deleted: bool,
}

impl TargetGroup {
    pub fn new(
        gateway: Arc<dyn CloudGateway>,
        ingress_id: &str,
        svc_name: &str,
        desired: TargetGroupDescription,
    ) -> Self {
        Self {
            gateway,
            ingress_id: ingress_id.to_string(),
            svc_name: svc_name.to_string(),
            current: None,
            desired: Some(desired),
            deleted: false,
        }
    }

    /// Track a target group found remotely. It has no desired state until an Ingress claims it.
    pub fn adopt(
        gateway: Arc<dyn CloudGateway>,
        ingress_id: &str,
        svc_name: &str,
        current: TargetGroupDescription,
    ) -> Self {
        Self {
            gateway,
            ingress_id: ingress_id.to_string(),
            svc_name: svc_name.to_string(),
            current: Some(current),
            desired: None,
            deleted: false,
        }
    }

    /// Remote identifier, once created.
    pub fn arn(&self) -> Option<&str> {
        self.current
            .as_ref()
            .and_then(|c| c.target_group_arn.as_deref())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn entity(&self) -> String {
        format!("target-group {}:{}", self.ingress_id, self.svc_name)
    }

    /// Create the group if it should exist and doesn't, delete it if it shouldn't.
    /// Attributes are fixed at creation; an existing group is left alone.
    pub async fn reconcile(&mut self) -> Result<(), ReconcileError> {
        match (self.desired.is_some(), self.current.is_some()) {
            (false, false) => {
                self.deleted = true;
            }
            (false, true) => self.delete().await?,
            (true, false) => self.create().await?,
            (true, true) => {
                debug!(
                    "TargetGroup {}: no modification required for {}",
                    self.ingress_id, self.svc_name
                );
            }
        }
        Ok(())
    }

    async fn create(&mut self) -> Result<(), ReconcileError> {
        let Some(desired) = self.desired.as_ref() else {
            return Ok(());
        };
        let input = CreateTargetGroupInput {
            name: desired.name.clone(),
            port: desired.port,
            protocol: desired.protocol.clone(),
            vpc_id: desired.vpc_id.clone(),
            tags: desired.tags.clone(),
        };
        match self.gateway.create_target_group(input).await {
            Ok(created) => {
                info!(
                    "TargetGroup {}: created {} for service {}",
                    self.ingress_id, created.name, self.svc_name
                );
                self.current = Some(created);
                self.deleted = false;
                Ok(())
            }
            Err(e) => {
                error!(
                    "TargetGroup {}: failed to create group for service {}: {}",
                    self.ingress_id, self.svc_name, e
                );
                Err(ReconcileError::remote("create_target_group", self.entity(), e))
            }
        }
    }

    pub(crate) async fn delete(&mut self) -> Result<(), ReconcileError> {
        let Some(arn) = self.arn().map(str::to_string) else {
            return Err(ReconcileError::invariant(
                self.entity(),
                "remote target group has no identifier",
            ));
        };
        match self.gateway.delete_target_group(&arn).await {
            Ok(()) => {
                info!("TargetGroup {}: deleted {}", self.ingress_id, arn);
            }
            Err(e) if e.is_not_found() => {
                debug!("TargetGroup {}: {} already gone", self.ingress_id, arn);
            }
            Err(e) => {
                error!("TargetGroup {}: failed to delete {}: {}", self.ingress_id, arn, e);
                return Err(ReconcileError::remote("delete_target_group", self.entity(), e));
            }
        }
        self.current = None;
        self.deleted = true;
        Ok(())
    }
}

/// Outcome of resolving a rule's service to a target group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetResolution {
    /// The service has its own group.
    Found(String),
    /// The service has no group; the first group of the set stands in.
    Fallback(String),
    /// No group in the set has a remote identifier yet.
    Unavailable,
}

/// Target groups of one load balancer, at most one per service name.
#[derive(Default)]
pub struct TargetGroupSet {
    groups: Vec<TargetGroup>,
}

impl TargetGroupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the live group for `svc_name`.
    pub fn lookup_by_svc(&self, svc_name: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|g| !g.deleted && g.svc_name == svc_name)
    }

    pub fn get(&self, svc_name: &str) -> Option<&TargetGroup> {
        self.lookup_by_svc(svc_name).map(|i| &self.groups[i])
    }

    /// Append a group. Fails if the service already has one.
    pub fn push(&mut self, group: TargetGroup) -> Result<(), ReconcileError> {
        if self.lookup_by_svc(&group.svc_name).is_some() {
            return Err(ReconcileError::invariant(
                group.entity(),
                "service already has a target group",
            ));
        }
        self.groups.push(group);
        Ok(())
    }

    /// Remote identifier of the service's own group, if it has been created.
    pub fn arn_for(&self, svc_name: &str) -> Option<&str> {
        self.get(svc_name).and_then(|g| g.arn())
    }

    /// Remote identifier of the first created group that is still wanted.
    /// Groups queued for removal in this cycle are never a fallback target.
    pub fn first_arn(&self) -> Option<&str> {
        self.groups
            .iter()
            .filter(|g| !g.deleted && g.desired.is_some())
            .find_map(|g| g.arn())
    }

    /// Resolve `svc_name`, falling back to the first created group.
    pub fn resolve(&self, svc_name: &str) -> TargetResolution {
        if let Some(arn) = self.arn_for(svc_name) {
            return TargetResolution::Found(arn.to_string());
        }
        match self.first_arn() {
            Some(arn) => TargetResolution::Fallback(arn.to_string()),
            None => TargetResolution::Unavailable,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetGroup> {
        self.groups.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TargetGroup> {
        self.groups.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Drop groups whose remote counterpart is gone.
    pub fn prune_deleted(&mut self) {
        self.groups.retain(|g| !g.deleted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_cloud::{GatewayCall, GatewayError, MemoryGateway};

    fn make_desired(name: &str) -> TargetGroupDescription {
        TargetGroupDescription {
            target_group_arn: None,
            name: name.to_string(),
            port: 8080,
            protocol: "HTTP".to_string(),
            vpc_id: Some("vpc-1".to_string()),
            tags: vec![],
        }
    }

    fn make_group(gw: &MemoryGateway, svc: &str) -> TargetGroup {
        TargetGroup::new(Arc::new(gw.clone()), "default/web", svc, make_desired(svc))
    }

    #[tokio::test]
    async fn test_create_then_noop() {
        let gw = MemoryGateway::new();
        let mut tg = make_group(&gw, "svc-a");
        tg.reconcile().await.unwrap();
        assert!(tg.arn().is_some());
        tg.reconcile().await.unwrap();
        assert_eq!(
            gw.calls().await,
            vec![GatewayCall::CreateTargetGroup {
                name: "svc-a".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_delete_tolerates_not_found() {
        let gw = MemoryGateway::new();
        let mut tg = TargetGroup::adopt(
            Arc::new(gw.clone()),
            "default/web",
            "svc-a",
            TargetGroupDescription {
                target_group_arn: Some("arn:tg/gone".to_string()),
                ..make_desired("svc-a")
            },
        );
        tg.reconcile().await.unwrap();
        assert!(tg.is_deleted());
        assert!(tg.current.is_none());
    }

    #[tokio::test]
    async fn test_failed_create_keeps_state() {
        let gw = MemoryGateway::new();
        gw.fail_next(
            "create_target_group",
            GatewayError::Transient("throttled".to_string()),
        )
        .await;
        let mut tg = make_group(&gw, "svc-a");
        let err = tg.reconcile().await.unwrap_err();
        assert!(err.is_transient());
        assert!(tg.current.is_none());
        assert!(!tg.is_deleted());
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_first_group() {
        let gw = MemoryGateway::new();
        let mut set = TargetGroupSet::new();
        set.push(make_group(&gw, "svc-a")).unwrap();
        set.push(make_group(&gw, "svc-b")).unwrap();
        assert_eq!(set.resolve("svc-a"), TargetResolution::Unavailable);

        for g in set.iter_mut() {
            g.reconcile().await.unwrap();
        }
        let a = set.arn_for("svc-a").unwrap().to_string();
        let b = set.arn_for("svc-b").unwrap().to_string();
        assert_eq!(set.resolve("svc-b"), TargetResolution::Found(b));
        assert_eq!(set.resolve("svc-x"), TargetResolution::Fallback(a));
    }

    #[tokio::test]
    async fn test_fallback_ignores_unwanted_groups() {
        let gw = MemoryGateway::new();
        let mut set = TargetGroupSet::new();
        set.push(make_group(&gw, "svc-a")).unwrap();
        set.push(make_group(&gw, "svc-b")).unwrap();
        for g in set.iter_mut() {
            g.reconcile().await.unwrap();
        }
        let b = set.arn_for("svc-b").unwrap().to_string();

        for g in set.iter_mut().filter(|g| g.svc_name == "svc-a") {
            g.desired = None;
        }
        assert_eq!(set.resolve("svc-x"), TargetResolution::Fallback(b));

        for g in set.iter_mut() {
            g.desired = None;
        }
        assert_eq!(set.resolve("svc-x"), TargetResolution::Unavailable);
    }

    #[test]
    fn test_one_group_per_service() {
        let gw = MemoryGateway::new();
        let mut set = TargetGroupSet::new();
        set.push(make_group(&gw, "svc-a")).unwrap();
        assert!(set.push(make_group(&gw, "svc-a")).is_err());
        assert_eq!(set.len(), 1);
        assert_eq!(set.lookup_by_svc("svc-a"), Some(0));
        assert_eq!(set.lookup_by_svc("svc-b"), None);
    }
}
