//! Listener rules.
//!
//! A rule's next step is chosen by [`decide`], a pure function of its current and
//! desired snapshots; [`Rule::reconcile`] then applies that step against the gateway.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use pkg_cloud::model::{
    CreateRuleInput, ModifyRuleInput, RuleAction, RuleCondition, RuleDescription,
};
use pkg_cloud::CloudGateway;
use pkg_constants::alb::DEFAULT_RULE_PATH;

use crate::error::{CycleReport, ReconcileError};
use crate::target_group::{TargetGroupSet, TargetResolution};

/// The step a rule needs to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePlan {
    /// The rule should not exist. Deletes it remotely if it was ever created.
    ToDelete,
    /// The rule is the listener default. Nothing to call; the binding lives on the listener.
    DefaultNoop,
    /// The rule should exist and doesn't.
    ToCreate,
    /// Conditions or target drifted.
    ToModify,
    Noop,
}

/// Identity of a rule within its listener.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleKey {
    Default,
    Path(String),
}

impl RuleKey {
    pub fn of(description: &RuleDescription) -> Self {
        if description.is_default {
            return RuleKey::Default;
        }
        let path = description
            .conditions
            .first()
            .and_then(|c| c.values.first())
            .cloned()
            .unwrap_or_default();
        RuleKey::Path(path)
    }
}

/// Desired snapshot for an Ingress path. `/` becomes the listener default.
pub fn desired_for_path(path: &str) -> RuleDescription {
    if path == DEFAULT_RULE_PATH {
        RuleDescription {
            rule_arn: None,
            priority: None,
            is_default: true,
            conditions: Vec::new(),
            actions: vec![RuleAction::forward(None)],
        }
    } else {
        RuleDescription {
            rule_arn: None,
            priority: None,
            is_default: false,
            conditions: vec![RuleCondition::path_pattern(path)],
            actions: vec![RuleAction::forward(None)],
        }
    }
}

fn target_of(description: &RuleDescription) -> Option<&str> {
    description
        .actions
        .first()
        .and_then(|a| a.target_group_arn.as_deref())
}

/// Conditions are compared through their serialized form. The target only counts when
/// the rule's own service resolved to a group (`desired_target`); fallback targets are
/// never treated as drift.
pub fn needs_modification(
    current: &RuleDescription,
    desired: &RuleDescription,
    desired_target: Option<&str>,
) -> bool {
    let conditions_differ = serde_json::to_string(&current.conditions).ok()
        != serde_json::to_string(&desired.conditions).ok();
    let target_differs = desired_target.is_some_and(|t| target_of(current) != Some(t));
    conditions_differ || target_differs
}

/// Choose the single step that moves `current` towards `desired`.
///
/// `is_default` takes precedence over the condition diff: a desired default is
/// always `DefaultNoop`, and a desired path rule whose current counterpart is the
/// listener default is created next to it rather than modified.
pub fn decide(
    current: Option<&RuleDescription>,
    desired: Option<&RuleDescription>,
    desired_target: Option<&str>,
) -> RulePlan {
    match (current, desired) {
        (Some(c), None) if c.is_default => RulePlan::DefaultNoop,
        (_, None) => RulePlan::ToDelete,
        (_, Some(d)) if d.is_default => RulePlan::DefaultNoop,
        (None, Some(_)) => RulePlan::ToCreate,
        (Some(c), Some(_)) if c.is_default => RulePlan::ToCreate,
        (Some(c), Some(d)) if needs_modification(c, d, desired_target) => RulePlan::ToModify,
        _ => RulePlan::Noop,
    }
}

/// What a rule borrows from its load balancer and listener while reconciling.
pub struct RuleScope<'a> {
    pub target_groups: &'a TargetGroupSet,
    /// Shared by every listener of the load balancer.
    pub last_rule_priority: &'a mut i64,
    /// `None` while the owning listener has not been created.
    pub listener_arn: Option<&'a str>,
    pub report: &'a mut CycleReport,
}

/// One Ingress path bound to a listener.
pub struct Rule {
    gateway: Arc<dyn CloudGateway>,
    pub ingress_id: String,
    pub svc_name: String,
    /// Remote snapshot. `None` until created and after a successful delete.
    pub current: Option<RuleDescription>,
    /// `None` when the Ingress no longer has this path.
    pub desired: Option<RuleDescription>,
    deleted: bool,
}

impl Rule {
    pub fn new(
        gateway: Arc<dyn CloudGateway>,
        ingress_id: &str,
        svc_name: &str,
        desired: RuleDescription,
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

    /// Track a rule found remotely. It has no desired state until an Ingress claims it.
    pub fn adopt(
        gateway: Arc<dyn CloudGateway>,
        ingress_id: &str,
        svc_name: &str,
        current: RuleDescription,
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

    pub fn key(&self) -> Option<RuleKey> {
        self.desired
            .as_ref()
            .or(self.current.as_ref())
            .map(RuleKey::of)
    }

    pub fn is_default(&self) -> bool {
        self.key() == Some(RuleKey::Default)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn priority(&self) -> Option<i64> {
        self.current.as_ref().and_then(|c| c.priority)
    }

    fn label(&self) -> String {
        match self.key() {
            Some(RuleKey::Path(p)) => p,
            Some(RuleKey::Default) => "default".to_string(),
            None => "<empty>".to_string(),
        }
    }

    pub fn entity(&self) -> String {
        format!("rule {}:{}", self.ingress_id, self.label())
    }

    /// Equal iff both sides exist with the same `is_default` and conditions.
    /// Priority is not compared: an Ingress does not order its paths.
    pub fn equals(&self, target: Option<&RuleDescription>) -> bool {
        match (self.current.as_ref(), target) {
            (Some(c), Some(t)) => c.is_default == t.is_default && c.conditions == t.conditions,
            _ => false,
        }
    }

    /// Step this rule would take now.
    pub fn plan(&self, target_groups: &TargetGroupSet) -> RulePlan {
        if self.deleted && self.desired.is_none() {
            return RulePlan::Noop;
        }
        decide(
            self.current.as_ref(),
            self.desired.as_ref(),
            target_groups.arn_for(&self.svc_name),
        )
    }

    /// Compare current and desired state and apply the one step that converges them.
    pub async fn reconcile(
        &mut self,
        scope: &mut RuleScope<'_>,
    ) -> Result<RulePlan, ReconcileError> {
        let plan = self.plan(scope.target_groups);
        match plan {
            RulePlan::ToDelete => {
                if self.current.is_none() {
                    self.deleted = true;
                } else {
                    info!("Rule {}: deleting {}", self.ingress_id, self.label());
                    self.delete().await?;
                }
            }
            RulePlan::DefaultNoop => {
                if let Some(desired) = &self.desired {
                    debug!(
                        "Rule {}: default rule is bound to its listener, adopting desired state",
                        self.ingress_id
                    );
                    self.current = Some(desired.clone());
                }
            }
            RulePlan::ToCreate => self.create(scope).await?,
            RulePlan::ToModify => self.modify(scope).await?,
            RulePlan::Noop => {
                debug!("Rule {}: no modification required for {}", self.ingress_id, self.label());
            }
        }
        Ok(plan)
    }

    /// Resolve the forward target, recording a lookup miss as a warning.
    fn resolve_target(&self, scope: &mut RuleScope<'_>) -> Result<String, ReconcileError> {
        match scope.target_groups.resolve(&self.svc_name) {
            TargetResolution::Found(arn) => Ok(arn),
            TargetResolution::Fallback(arn) => {
                warn!(
                    "Rule {}: no target group for service {}, defaulting to first target group",
                    self.ingress_id, self.svc_name
                );
                scope.report.warn(ReconcileError::LookupMiss {
                    ingress_id: self.ingress_id.clone(),
                    service: self.svc_name.clone(),
                });
                Ok(arn)
            }
            TargetResolution::Unavailable => Err(ReconcileError::invariant(
                self.entity(),
                "load balancer has no target group to forward to",
            )),
        }
    }

    fn forward_actions(&self, target_arn: &str) -> Vec<RuleAction> {
        vec![RuleAction::forward(Some(target_arn.to_string()))]
    }

    async fn create(&mut self, scope: &mut RuleScope<'_>) -> Result<(), ReconcileError> {
        let Some(listener_arn) = scope.listener_arn else {
            return Err(ReconcileError::invariant(
                self.entity(),
                "listener has not been created",
            ));
        };
        let Some(desired) = self.desired.as_ref() else {
            return Ok(());
        };
        let conditions = desired.conditions.clone();
        let target = self.resolve_target(scope)?;
        let priority = *scope.last_rule_priority;
        let input = CreateRuleInput {
            listener_arn: listener_arn.to_string(),
            priority,
            conditions,
            actions: self.forward_actions(&target),
        };

        match self.gateway.create_rule(input).await {
            Ok(created) => {
                info!(
                    "Rule {}: created {} with priority {}",
                    self.ingress_id,
                    self.label(),
                    priority
                );
                self.current = Some(created);
                self.deleted = false;
                // Every created rule consumes a priority; values are never handed out twice.
                *scope.last_rule_priority += 1;
                Ok(())
            }
            Err(e) => {
                error!(
                    "Rule {}: failed to create {}: {}",
                    self.ingress_id,
                    self.label(),
                    e
                );
                Err(ReconcileError::remote("create_rule", self.entity(), e))
            }
        }
    }

    async fn modify(&mut self, scope: &mut RuleScope<'_>) -> Result<(), ReconcileError> {
        let Some(rule_arn) = self.current.as_ref().and_then(|c| c.rule_arn.clone()) else {
            return Err(ReconcileError::invariant(
                self.entity(),
                "current rule has no remote identifier",
            ));
        };
        let Some(desired) = self.desired.as_ref() else {
            return Ok(());
        };
        let conditions = desired.conditions.clone();
        let target = self.resolve_target(scope)?;
        let input = ModifyRuleInput {
            rule_arn: rule_arn.clone(),
            conditions,
            actions: self.forward_actions(&target),
        };

        match self.gateway.modify_rule(input).await {
            Ok(mut modified) => {
                info!("Rule {}: modified {}", self.ingress_id, self.label());
                if modified.priority.is_none() {
                    modified.priority = self.priority();
                }
                self.current = Some(modified);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                // Removed behind our back; recreate on the next cycle.
                warn!(
                    "Rule {}: {} vanished remotely, will recreate",
                    self.ingress_id, rule_arn
                );
                self.current = None;
                Err(ReconcileError::remote("modify_rule", self.entity(), e))
            }
            Err(e) => {
                error!(
                    "Rule {}: failed to modify {}: {}",
                    self.ingress_id,
                    self.label(),
                    e
                );
                Err(ReconcileError::remote("modify_rule", self.entity(), e))
            }
        }
    }

    pub(crate) async fn delete(&mut self) -> Result<(), ReconcileError> {
        let Some(current) = self.current.as_ref() else {
            self.deleted = true;
            return Ok(());
        };
        if current.is_default {
            return Err(ReconcileError::invariant(
                self.entity(),
                "default rules are removed with their listener",
            ));
        }
        let Some(rule_arn) = current.rule_arn.clone() else {
            return Err(ReconcileError::invariant(
                self.entity(),
                "current rule has no remote identifier",
            ));
        };

        match self.gateway.delete_rule(&rule_arn).await {
            Ok(()) => {
                info!("Rule {}: deleted {}", self.ingress_id, self.label());
            }
            Err(e) if e.is_not_found() => {
                debug!("Rule {}: {} already gone", self.ingress_id, rule_arn);
            }
            Err(e) => {
                error!("Rule {}: failed to delete {}: {}", self.ingress_id, rule_arn, e);
                return Err(ReconcileError::remote("delete_rule", self.entity(), e));
            }
        }
        self.current = None;
        self.deleted = true;
        Ok(())
    }

    /// Forget the remote counterpart after the owning listener was deleted.
    pub(crate) fn retire_with_listener(&mut self) {
        self.current = None;
        self.desired = None;
        self.deleted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target_group::TargetGroup;
    use pkg_cloud::model::{
        CreateListenerInput, CreateLoadBalancerInput, TargetGroupDescription,
    };
    use pkg_cloud::{GatewayCall, GatewayError, MemoryGateway};

    const INGRESS: &str = "default/web";

    /// A remote load balancer with one listener and target groups for `services`.
    async fn make_remote(gw: &MemoryGateway, services: &[&str]) -> (String, TargetGroupSet) {
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
        let first = set.iter().next().and_then(|g| g.arn()).map(str::to_string);
        let listener = gw
            .create_listener(CreateListenerInput {
                load_balancer_arn: lb.load_balancer_arn.unwrap(),
                port: 80,
                protocol: "HTTP".to_string(),
                default_actions: vec![RuleAction::forward(first)],
            })
            .await
            .unwrap();
        gw.clear_calls().await;
        (listener.listener_arn.unwrap(), set)
    }

    fn make_rule(gw: &MemoryGateway, path: &str, svc: &str) -> Rule {
        Rule::new(Arc::new(gw.clone()), INGRESS, svc, desired_for_path(path))
    }

    fn make_current(path: &str, priority: i64, target: Option<&str>) -> RuleDescription {
        RuleDescription {
            rule_arn: Some(format!("arn:rule/{}", priority)),
            priority: Some(priority),
            actions: vec![RuleAction::forward(target.map(str::to_string))],
            ..desired_for_path(path)
        }
    }

    #[test]
    fn test_decide_table() {
        let path = desired_for_path("/api");
        let other = desired_for_path("/other");
        let default = desired_for_path("/");
        let current = make_current("/api", 3, Some("tg-a"));

        assert_eq!(decide(None, None, None), RulePlan::ToDelete);
        assert_eq!(decide(Some(&current), None, None), RulePlan::ToDelete);
        assert_eq!(decide(Some(&default), None, None), RulePlan::DefaultNoop);
        assert_eq!(decide(None, Some(&default), None), RulePlan::DefaultNoop);
        assert_eq!(decide(None, Some(&path), None), RulePlan::ToCreate);
        assert_eq!(decide(Some(&default), Some(&path), None), RulePlan::ToCreate);
        assert_eq!(decide(Some(&current), Some(&other), None), RulePlan::ToModify);
        assert_eq!(decide(Some(&current), Some(&path), Some("tg-a")), RulePlan::Noop);
        assert_eq!(decide(Some(&current), Some(&path), Some("tg-b")), RulePlan::ToModify);
        assert_eq!(decide(Some(&current), Some(&path), None), RulePlan::Noop);
    }

    #[test]
    fn test_equals_ignores_priority() {
        let gw = MemoryGateway::new();
        let mut rule = make_rule(&gw, "/api", "svc-a");
        assert!(!rule.equals(None));
        assert!(!rule.equals(Some(&desired_for_path("/api"))));

        rule.current = Some(make_current("/api", 3, None));
        assert!(rule.equals(Some(&make_current("/api", 9, None))));
        assert!(!rule.equals(Some(&make_current("/other", 3, None))));
        assert!(!rule.equals(Some(&desired_for_path("/"))));
        assert!(!rule.equals(None));
    }

    #[tokio::test]
    async fn test_create_uses_and_advances_priority() {
        let gw = MemoryGateway::new();
        let (listener_arn, set) = make_remote(&gw, &["svc-a", "svc-b"]).await;
        let mut priority = 3;
        let mut report = CycleReport::default();
        let mut rule = make_rule(&gw, "/api", "svc-a");

        let plan = {
            let mut scope = RuleScope {
                target_groups: &set,
                last_rule_priority: &mut priority,
                listener_arn: Some(&listener_arn),
                report: &mut report,
            };
            rule.reconcile(&mut scope).await.unwrap()
        };

        assert_eq!(plan, RulePlan::ToCreate);
        assert_eq!(priority, 4);
        assert_eq!(
            gw.calls().await,
            vec![GatewayCall::CreateRule {
                listener_arn: listener_arn.clone(),
                priority: 3
            }]
        );
        let current = rule.current.as_ref().unwrap();
        assert_eq!(current.conditions, vec![RuleCondition::path_pattern("/api")]);
        assert_eq!(target_of(current), set.arn_for("svc-a"));
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let gw = MemoryGateway::new();
        let (listener_arn, set) = make_remote(&gw, &["svc-a"]).await;
        let mut priority = 1;
        let mut report = CycleReport::default();
        let mut rule = make_rule(&gw, "/api", "svc-a");

        for _ in 0..3 {
            let mut scope = RuleScope {
                target_groups: &set,
                last_rule_priority: &mut priority,
                listener_arn: Some(&listener_arn),
                report: &mut report,
            };
            rule.reconcile(&mut scope).await.unwrap();
        }
        assert_eq!(gw.mutations().await.len(), 1);
        assert_eq!(priority, 2);
        assert_eq!(rule.plan(&set), RulePlan::Noop);
    }

    #[tokio::test]
    async fn test_lookup_miss_falls_back_with_warning() {
        let gw = MemoryGateway::new();
        let (listener_arn, set) = make_remote(&gw, &["svc-a", "svc-b"]).await;
        let mut priority = 1;
        let mut report = CycleReport::default();
        let mut rule = make_rule(&gw, "/missing", "svc-x");

        {
            let mut scope = RuleScope {
                target_groups: &set,
                last_rule_priority: &mut priority,
                listener_arn: Some(&listener_arn),
                report: &mut report,
            };
            rule.reconcile(&mut scope).await.unwrap();
        }
        assert_eq!(target_of(rule.current.as_ref().unwrap()), set.arn_for("svc-a"));
        assert_eq!(report.lookup_misses(), 1);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_default_rule_never_calls_gateway() {
        let gw = MemoryGateway::new();
        let (listener_arn, set) = make_remote(&gw, &["svc-a"]).await;
        let mut priority = 1;
        let mut report = CycleReport::default();
        let mut rule = make_rule(&gw, "/", "svc-a");

        {
            let mut scope = RuleScope {
                target_groups: &set,
                last_rule_priority: &mut priority,
                listener_arn: Some(&listener_arn),
                report: &mut report,
            };
            assert_eq!(rule.reconcile(&mut scope).await.unwrap(), RulePlan::DefaultNoop);
            assert_eq!(rule.current, rule.desired);

            rule.desired = None;
            assert_eq!(rule.reconcile(&mut scope).await.unwrap(), RulePlan::DefaultNoop);
        }
        assert!(!rule.is_deleted());
        assert!(gw.calls().await.is_empty());
        assert_eq!(priority, 1);
        assert!(rule.delete().await.is_err());
    }

    #[tokio::test]
    async fn test_delete_never_created_rule() {
        let gw = MemoryGateway::new();
        let set = TargetGroupSet::new();
        let mut priority = 1;
        let mut report = CycleReport::default();
        let mut rule = make_rule(&gw, "/api", "svc-a");
        rule.desired = None;

        let mut scope = RuleScope {
            target_groups: &set,
            last_rule_priority: &mut priority,
            listener_arn: None,
            report: &mut report,
        };
        assert_eq!(rule.reconcile(&mut scope).await.unwrap(), RulePlan::ToDelete);
        assert!(rule.is_deleted());
        assert!(gw.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_created_rule_once() {
        let gw = MemoryGateway::new();
        let (listener_arn, set) = make_remote(&gw, &["svc-a"]).await;
        let mut priority = 1;
        let mut report = CycleReport::default();
        let mut rule = make_rule(&gw, "/api", "svc-a");

        let mut scope = RuleScope {
            target_groups: &set,
            last_rule_priority: &mut priority,
            listener_arn: Some(&listener_arn),
            report: &mut report,
        };
        rule.reconcile(&mut scope).await.unwrap();
        let rule_arn = rule.current.as_ref().and_then(|c| c.rule_arn.clone()).unwrap();
        gw.clear_calls().await;

        rule.desired = None;
        rule.reconcile(&mut scope).await.unwrap();
        rule.reconcile(&mut scope).await.unwrap();

        assert!(rule.is_deleted());
        assert!(rule.current.is_none());
        assert_eq!(gw.calls().await, vec![GatewayCall::DeleteRule { arn: rule_arn }]);
    }

    #[tokio::test]
    async fn test_modify_replaces_conditions() {
        let gw = MemoryGateway::new();
        let (listener_arn, set) = make_remote(&gw, &["svc-a", "svc-b"]).await;
        let mut priority = 1;
        let mut report = CycleReport::default();
        let mut rule = make_rule(&gw, "/api", "svc-a");

        let mut scope = RuleScope {
            target_groups: &set,
            last_rule_priority: &mut priority,
            listener_arn: Some(&listener_arn),
            report: &mut report,
        };
        rule.reconcile(&mut scope).await.unwrap();
        gw.clear_calls().await;

        rule.desired = Some(desired_for_path("/api/v2"));
        rule.svc_name = "svc-b".to_string();
        assert_eq!(rule.reconcile(&mut scope).await.unwrap(), RulePlan::ToModify);

        let current = rule.current.clone().unwrap();
        assert_eq!(current.conditions, vec![RuleCondition::path_pattern("/api/v2")]);
        assert_eq!(target_of(&current), set.arn_for("svc-b"));
        assert_eq!(current.priority, Some(1));
        assert_eq!(gw.mutations().await.len(), 1);
        assert_eq!(*scope.last_rule_priority, 2);
        assert_eq!(gw.rules_of(&listener_arn).await[0].conditions, current.conditions);
    }

    #[tokio::test]
    async fn test_failed_create_keeps_priority() {
        let gw = MemoryGateway::new();
        let (listener_arn, set) = make_remote(&gw, &["svc-a"]).await;
        gw.fail_next("create_rule", GatewayError::Transient("throttled".to_string()))
            .await;
        let mut priority = 5;
        let mut report = CycleReport::default();
        let mut rule = make_rule(&gw, "/api", "svc-a");

        let mut scope = RuleScope {
            target_groups: &set,
            last_rule_priority: &mut priority,
            listener_arn: Some(&listener_arn),
            report: &mut report,
        };
        let err = rule.reconcile(&mut scope).await.unwrap_err();
        assert!(err.is_transient());
        assert!(rule.current.is_none());
        assert_eq!(rule.plan(&set), RulePlan::ToCreate);

        rule.reconcile(&mut scope).await.unwrap();
        assert_eq!(rule.priority(), Some(5));
        assert_eq!(priority, 6);
    }

    #[tokio::test]
    async fn test_create_without_listener_is_invariant_violation() {
        let gw = MemoryGateway::new();
        let (_, set) = make_remote(&gw, &["svc-a"]).await;
        let mut priority = 1;
        let mut report = CycleReport::default();
        let mut rule = make_rule(&gw, "/api", "svc-a");

        let mut scope = RuleScope {
            target_groups: &set,
            last_rule_priority: &mut priority,
            listener_arn: None,
            report: &mut report,
        };
        let err = rule.reconcile(&mut scope).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvariantViolation { .. }));
        assert!(gw.calls().await.is_empty());
    }
}
