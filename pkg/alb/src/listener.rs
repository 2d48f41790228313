use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use pkg_cloud::model::{CreateListenerInput, ListenerDescription, ManagedListener, RuleAction};
use pkg_cloud::CloudGateway;

use crate::desired::DesiredListener;
use crate::error::{CycleReport, ReconcileError};
use crate::rule::{Rule, RuleKey, RuleScope};
use crate::target_group::{TargetGroupSet, TargetResolution};

/// What a listener borrows from its load balancer while reconciling.
pub struct ListenerScope<'a> {
    /// `None` while the load balancer has not been created.
    pub load_balancer_arn: Option<&'a str>,
    pub target_groups: &'a TargetGroupSet,
    pub last_rule_priority: &'a mut i64,
    pub report: &'a mut CycleReport,
}

/// A listener port of a load balancer and the rules bound to it.
pub struct Listener {
    gateway: Arc<dyn CloudGateway>,
    pub ingress_id: String,
    pub current: Option<ListenerDescription>,
    pub desired: Option<ListenerDescription>,
    /// Service whose target group receives unmatched traffic.
    pub default_service: Option<String>,
    pub rules: Vec<Rule>,
    deleted: bool,
}

impl Listener {
    pub fn new(
        gateway: Arc<dyn CloudGateway>,
        ingress_id: &str,
        desired: &DesiredListener,
    ) -> Self {
        let rules = desired
            .rules
            .iter()
            .map(|r| Rule::new(gateway.clone(), ingress_id, &r.svc_name, r.description.clone()))
            .collect();
        Self {
            gateway,
            ingress_id: ingress_id.to_string(),
            current: None,
            desired: Some(desired.description.clone()),
            default_service: desired.default_service().map(str::to_string),
            rules,
            deleted: false,
        }
    }

    /// Track a listener found remotely. `services` maps target group identifiers to
    /// the service they front, so adopted rules know which service they forward to.
    pub fn adopt(
        gateway: Arc<dyn CloudGateway>,
        ingress_id: &str,
        managed: ManagedListener,
        services: &HashMap<String, String>,
    ) -> Self {
        let service_of = |actions: &[RuleAction]| {
            actions
                .first()
                .and_then(|a| a.target_group_arn.as_ref())
                .and_then(|arn| services.get(arn))
                .cloned()
        };
        let default_service = service_of(&managed.listener.default_actions[..]);
        let rules = managed
            .rules
            .into_iter()
            .map(|r| {
                let svc = service_of(&r.actions[..]).unwrap_or_default();
                Rule::adopt(gateway.clone(), ingress_id, &svc, r)
            })
            .collect();
        Self {
            gateway,
            ingress_id: ingress_id.to_string(),
            current: Some(managed.listener),
            desired: None,
            default_service,
            rules,
            deleted: false,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.desired
            .as_ref()
            .or(self.current.as_ref())
            .map(|l| l.port)
    }

    pub fn arn(&self) -> Option<&str> {
        self.current.as_ref().and_then(|c| c.listener_arn.as_deref())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn entity(&self) -> String {
        match self.port() {
            Some(port) => format!("listener {}:{}", self.ingress_id, port),
            None => format!("listener {}", self.ingress_id),
        }
    }

    /// Target groups the remote listener currently forwards unmatched traffic to.
    pub fn default_targets(&self) -> Vec<&str> {
        self.current
            .iter()
            .flat_map(|c| c.default_actions.iter())
            .filter_map(|a| a.target_group_arn.as_deref())
            .collect()
    }

    /// Take over a freshly built desired state. Rules are matched by path (or as the
    /// default rule); unmatched rules lose their desired state and rules deleted in an
    /// earlier cycle are dropped.
    pub fn merge(&mut self, desired: &DesiredListener) {
        self.rules.retain(|r| !r.is_deleted());
        self.desired = Some(desired.description.clone());
        self.default_service = desired.default_service().map(str::to_string);

        let mut wanted: Vec<_> = desired
            .rules
            .iter()
            .map(|r| (RuleKey::of(&r.description), r))
            .collect();
        for rule in self.rules.iter_mut() {
            let key = rule.key();
            match wanted.iter().position(|(k, _)| Some(k) == key.as_ref()) {
                Some(i) => {
                    let (_, d) = wanted.remove(i);
                    rule.svc_name = d.svc_name.clone();
                    rule.desired = Some(d.description.clone());
                }
                None => rule.desired = None,
            }
        }
        for (_, d) in wanted {
            self.rules.push(Rule::new(
                self.gateway.clone(),
                &self.ingress_id,
                &d.svc_name,
                d.description.clone(),
            ));
        }
    }

    /// Drop the desired state of the listener and all of its rules.
    pub fn mark_for_deletion(&mut self) {
        self.desired = None;
        for rule in self.rules.iter_mut() {
            rule.desired = None;
        }
    }

    /// Two created non-default rules must never share a priority.
    pub fn check_priorities(&self) -> Result<(), ReconcileError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            let Some(current) = rule.current.as_ref() else {
                continue;
            };
            if current.is_default {
                continue;
            }
            if let Some(priority) = current.priority
                && !seen.insert(priority)
            {
                return Err(ReconcileError::invariant(
                    self.entity(),
                    format!("priority {} is held by more than one rule", priority),
                ));
            }
        }
        Ok(())
    }

    /// Ensure the remote listener exists, then reconcile the default rule followed by
    /// every other rule. Rule failures are recorded in the report and do not stop the
    /// remaining rules.
    pub async fn reconcile(
        &mut self,
        scope: &mut ListenerScope<'_>,
    ) -> Result<(), ReconcileError> {
        if self.desired.is_none() {
            if self.current.is_some() {
                info!("Listener {}: port no longer requested, deleting", self.ingress_id);
            }
            return self.delete().await;
        }
        if self.current.is_none() {
            self.create(scope).await?;
        } else {
            debug!("Listener {}: {} already exists", self.ingress_id, self.entity());
        }
        self.check_priorities()?;

        let listener_arn = self.current.as_ref().and_then(|c| c.listener_arn.as_deref());
        for default_pass in [true, false] {
            for rule in self.rules.iter_mut().filter(|r| r.is_default() == default_pass) {
                let mut rule_scope = RuleScope {
                    target_groups: scope.target_groups,
                    last_rule_priority: &mut *scope.last_rule_priority,
                    listener_arn,
                    report: &mut *scope.report,
                };
                if let Err(e) = rule.reconcile(&mut rule_scope).await {
                    scope.report.fail(rule.entity(), e);
                }
            }
        }
        Ok(())
    }

    fn default_target(&self, scope: &mut ListenerScope<'_>) -> Result<String, ReconcileError> {
        let Some(svc) = self.default_service.as_deref() else {
            return scope.target_groups.first_arn().map(str::to_string).ok_or_else(|| {
                ReconcileError::invariant(self.entity(), "no target group for the default action")
            });
        };
        match scope.target_groups.resolve(svc) {
            TargetResolution::Found(arn) => Ok(arn),
            TargetResolution::Fallback(arn) => {
                warn!(
                    "Listener {}: no target group for default service {}, using first target group",
                    self.ingress_id, svc
                );
                scope.report.warn(ReconcileError::LookupMiss {
                    ingress_id: self.ingress_id.clone(),
                    service: svc.to_string(),
                });
                Ok(arn)
            }
            TargetResolution::Unavailable => Err(ReconcileError::invariant(
                self.entity(),
                "no target group for the default action",
            )),
        }
    }

    async fn create(&mut self, scope: &mut ListenerScope<'_>) -> Result<(), ReconcileError> {
        let Some(load_balancer_arn) = scope.load_balancer_arn else {
            return Err(ReconcileError::invariant(
                self.entity(),
                "load balancer has not been created",
            ));
        };
        let Some(desired) = self.desired.as_ref() else {
            return Ok(());
        };
        let (port, protocol) = (desired.port, desired.protocol.clone());
        let target = self.default_target(scope)?;
        let input = CreateListenerInput {
            load_balancer_arn: load_balancer_arn.to_string(),
            port,
            protocol,
            default_actions: vec![RuleAction::forward(Some(target))],
        };

        match self.gateway.create_listener(input).await {
            Ok(created) => {
                info!("Listener {}: created on port {}", self.ingress_id, port);
                self.current = Some(created);
                self.deleted = false;
                Ok(())
            }
            Err(e) => {
                error!(
                    "Listener {}: failed to create on port {}: {}",
                    self.ingress_id, port, e
                );
                Err(ReconcileError::remote("create_listener", self.entity(), e))
            }
        }
    }

    /// Delete the non-default rules (highest priority first), then the listener itself.
    /// The default rule goes with the listener. Stops at the first failure.
    pub async fn delete(&mut self) -> Result<(), ReconcileError> {
        let mut order: Vec<usize> = (0..self.rules.len())
            .filter(|&i| self.rules[i].current.as_ref().is_some_and(|c| !c.is_default))
            .collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.rules[i].priority()));
        for i in order {
            let rule = &mut self.rules[i];
            rule.desired = None;
            rule.delete().await?;
        }

        if let Some(arn) = self.arn().map(str::to_string) {
            match self.gateway.delete_listener(&arn).await {
                Ok(()) => info!("Listener {}: deleted {}", self.ingress_id, arn),
                Err(e) if e.is_not_found() => {
                    debug!("Listener {}: {} already gone", self.ingress_id, arn);
                }
                Err(e) => {
                    error!("Listener {}: failed to delete {}: {}", self.ingress_id, arn, e);
                    return Err(ReconcileError::remote("delete_listener", self.entity(), e));
                }
            }
        }
        for rule in self.rules.iter_mut() {
            rule.retire_with_listener();
        }
        self.current = None;
        self.deleted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredRule;
    use crate::rule::desired_for_path;
    use crate::target_group::TargetGroup;
    use pkg_cloud::model::{CreateLoadBalancerInput, RuleDescription, TargetGroupDescription};
    use pkg_cloud::{GatewayCall, GatewayError, MemoryGateway};

    const INGRESS: &str = "default/web";

    fn make_desired(paths: &[(&str, &str)]) -> DesiredListener {
        DesiredListener {
            description: ListenerDescription {
                listener_arn: None,
                port: 80,
                protocol: "HTTP".to_string(),
                default_actions: vec![RuleAction::forward(None)],
            },
            rules: paths
                .iter()
                .map(|(path, svc)| DesiredRule {
                    svc_name: svc.to_string(),
                    description: desired_for_path(path),
                })
                .collect(),
        }
    }

    async fn make_parent(gw: &MemoryGateway, services: &[&str]) -> (String, TargetGroupSet) {
        let lb = gw
            .create_load_balancer(CreateLoadBalancerInput {
                name: "test-lb".to_string(),
                scheme: "internal".to_string(),
                subnets: vec![],
                security_groups: vec![],
                tags: vec![],
            })
            .await
            .unwrap();
        let mut set = TargetGroupSet::new();
        for svc in services {
            let mut tg = TargetGroup::new(
                Arc::new(gw.clone()),
                INGRESS,
                svc,
                TargetGroupDescription {
                    target_group_arn: None,
                    name: format!("tg-{}", svc),
                    port: 80,
                    protocol: "HTTP".to_string(),
                    vpc_id: None,
                    tags: vec![],
                },
            );
            tg.reconcile().await.unwrap();
            set.push(tg).unwrap();
        }
        gw.clear_calls().await;
        (lb.load_balancer_arn.unwrap(), set)
    }

    async fn run(
        listener: &mut Listener,
        lb_arn: &str,
        set: &TargetGroupSet,
        priority: &mut i64,
    ) -> (Result<(), ReconcileError>, CycleReport) {
        let mut report = CycleReport::default();
        let result = {
            let mut scope = ListenerScope {
                load_balancer_arn: Some(lb_arn),
                target_groups: set,
                last_rule_priority: priority,
                report: &mut report,
            };
            listener.reconcile(&mut scope).await
        };
        (result, report)
    }

    #[tokio::test]
    async fn test_create_binds_default_then_rules() {
        let gw = MemoryGateway::new();
        let (lb_arn, set) = make_parent(&gw, &["api", "front"]).await;
        let mut listener = Listener::new(
            Arc::new(gw.clone()),
            INGRESS,
            &make_desired(&[("/api", "api"), ("/", "front"), ("/docs", "api")]),
        );
        let mut priority = 3;
        let (result, report) = run(&mut listener, &lb_arn, &set, &mut priority).await;
        result.unwrap();
        assert!(report.is_success());

        let listener_arn = listener.arn().unwrap().to_string();
        assert_eq!(listener.default_targets(), vec![set.arn_for("front").unwrap()]);
        assert_eq!(
            gw.calls().await,
            vec![
                GatewayCall::CreateListener {
                    load_balancer_arn: lb_arn.clone(),
                    port: 80
                },
                GatewayCall::CreateRule {
                    listener_arn: listener_arn.clone(),
                    priority: 3
                },
                GatewayCall::CreateRule {
                    listener_arn: listener_arn.clone(),
                    priority: 4
                },
            ]
        );
        assert_eq!(priority, 5);

        gw.clear_calls().await;
        let (result, _) = run(&mut listener, &lb_arn, &set, &mut priority).await;
        result.unwrap();
        assert!(gw.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_without_default_rule_uses_first_group() {
        let gw = MemoryGateway::new();
        let (lb_arn, set) = make_parent(&gw, &["api", "front"]).await;
        let mut listener =
            Listener::new(Arc::new(gw.clone()), INGRESS, &make_desired(&[("/api", "front")]));
        let mut priority = 1;
        let (result, report) = run(&mut listener, &lb_arn, &set, &mut priority).await;
        result.unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(listener.default_targets(), vec![set.arn_for("api").unwrap()]);
    }

    #[tokio::test]
    async fn test_merge_removes_and_adds_rules() {
        let gw = MemoryGateway::new();
        let (lb_arn, set) = make_parent(&gw, &["api"]).await;
        let mut listener = Listener::new(
            Arc::new(gw.clone()),
            INGRESS,
            &make_desired(&[("/a", "api"), ("/b", "api")]),
        );
        let mut priority = 1;
        run(&mut listener, &lb_arn, &set, &mut priority).await.0.unwrap();
        let listener_arn = listener.arn().unwrap().to_string();
        let b_arn = listener.rules[1].current.as_ref().and_then(|c| c.rule_arn.clone()).unwrap();
        gw.clear_calls().await;

        listener.merge(&make_desired(&[("/a", "api"), ("/c", "api")]));
        run(&mut listener, &lb_arn, &set, &mut priority).await.0.unwrap();
        assert_eq!(
            gw.calls().await,
            vec![
                GatewayCall::DeleteRule { arn: b_arn },
                GatewayCall::CreateRule {
                    listener_arn: listener_arn.clone(),
                    priority: 3
                },
            ]
        );

        listener.merge(&make_desired(&[("/a", "api"), ("/c", "api")]));
        assert_eq!(listener.rules.len(), 2);
        let priorities: Vec<i64> = gw
            .rules_of(&listener_arn)
            .await
            .iter()
            .filter_map(|r| r.priority)
            .collect();
        assert_eq!(priorities, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_rule_failure_does_not_stop_siblings() {
        let gw = MemoryGateway::new();
        let (lb_arn, set) = make_parent(&gw, &["api"]).await;
        let mut listener = Listener::new(
            Arc::new(gw.clone()),
            INGRESS,
            &make_desired(&[("/a", "api"), ("/b", "api")]),
        );
        gw.fail_next("create_rule", GatewayError::Transient("throttled".to_string()))
            .await;
        let mut priority = 1;
        let (result, report) = run(&mut listener, &lb_arn, &set, &mut priority).await;
        result.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entity, "rule default/web:/a");
        assert!(listener.rules[0].current.is_none());
        assert_eq!(listener.rules[1].priority(), Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_priorities_are_rejected() {
        let gw = MemoryGateway::new();
        let (lb_arn, set) = make_parent(&gw, &["api"]).await;
        let mut listener = Listener::new(
            Arc::new(gw.clone()),
            INGRESS,
            &make_desired(&[("/a", "api"), ("/b", "api")]),
        );
        let mut priority = 1;
        run(&mut listener, &lb_arn, &set, &mut priority).await.0.unwrap();
        listener.rules[1].current = Some(RuleDescription {
            priority: Some(1),
            ..listener.rules[1].current.clone().unwrap()
        });
        gw.clear_calls().await;

        let (result, _) = run(&mut listener, &lb_arn, &set, &mut priority).await;
        assert!(matches!(result, Err(ReconcileError::InvariantViolation { .. })));
        assert!(gw.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_rules_before_listener() {
        let gw = MemoryGateway::new();
        let (lb_arn, set) = make_parent(&gw, &["api"]).await;
        let mut listener = Listener::new(
            Arc::new(gw.clone()),
            INGRESS,
            &make_desired(&[("/", "api"), ("/a", "api"), ("/b", "api")]),
        );
        let mut priority = 1;
        run(&mut listener, &lb_arn, &set, &mut priority).await.0.unwrap();
        let listener_arn = listener.arn().unwrap().to_string();
        gw.clear_calls().await;

        listener.mark_for_deletion();
        run(&mut listener, &lb_arn, &set, &mut priority).await.0.unwrap();

        let calls = gw.calls().await;
        let ops: Vec<&str> = calls.iter().map(|c| c.operation()).collect();
        assert_eq!(ops, vec!["delete_rule", "delete_rule", "delete_listener"]);
        assert_eq!(calls[2], GatewayCall::DeleteListener { arn: listener_arn });
        assert!(listener.is_deleted());
        assert!(listener.rules.iter().all(|r| r.is_deleted()));
        assert_eq!(gw.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_rule_delete_keeps_listener() {
        let gw = MemoryGateway::new();
        let (lb_arn, set) = make_parent(&gw, &["api"]).await;
        let mut listener =
            Listener::new(Arc::new(gw.clone()), INGRESS, &make_desired(&[("/a", "api")]));
        let mut priority = 1;
        run(&mut listener, &lb_arn, &set, &mut priority).await.0.unwrap();
        gw.fail_next("delete_rule", GatewayError::Permanent("denied".to_string()))
            .await;

        assert!(listener.delete().await.is_err());
        assert!(!listener.is_deleted());
        assert_eq!(gw.listener_count().await, 1);

        listener.delete().await.unwrap();
        assert!(listener.is_deleted());
    }
}
