//! In-process gateway.
//!
//! Keeps remote resources in maps, enforces the same referential rules as the real
//! API (no deleting a load balancer that still has listeners, no deleting a target
//! group still referenced, unique priorities per listener) and records every call
//! in order. Used for `--dry-run` and as the substitute gateway in tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use pkg_constants::alb::TAG_CLUSTER_NAME;

use crate::gateway::{CloudGateway, GatewayError};
use crate::model::{
    CreateListenerInput, CreateLoadBalancerInput, CreateRuleInput, CreateTargetGroupInput,
    ListenerDescription, LoadBalancerDescription, ManagedListener, ManagedLoadBalancer,
    ModifyRuleInput, RuleDescription, TargetGroupDescription, tag_value,
};

/// One recorded gateway invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    CreateLoadBalancer { name: String },
    DeleteLoadBalancer { arn: String },
    CreateTargetGroup { name: String },
    DeleteTargetGroup { arn: String },
    CreateListener { load_balancer_arn: String, port: u16 },
    DeleteListener { arn: String },
    CreateRule { listener_arn: String, priority: i64 },
    ModifyRule { arn: String },
    DeleteRule { arn: String },
    DescribeManaged { cluster_name: String },
}

impl GatewayCall {
    /// Operation name, as used by [`MemoryGateway::fail_next`].
    pub fn operation(&self) -> &'static str {
        match self {
            GatewayCall::CreateLoadBalancer { .. } => "create_load_balancer",
            GatewayCall::DeleteLoadBalancer { .. } => "delete_load_balancer",
            GatewayCall::CreateTargetGroup { .. } => "create_target_group",
            GatewayCall::DeleteTargetGroup { .. } => "delete_target_group",
            GatewayCall::CreateListener { .. } => "create_listener",
            GatewayCall::DeleteListener { .. } => "delete_listener",
            GatewayCall::CreateRule { .. } => "create_rule",
            GatewayCall::ModifyRule { .. } => "modify_rule",
            GatewayCall::DeleteRule { .. } => "delete_rule",
            GatewayCall::DescribeManaged { .. } => "describe_managed",
        }
    }

    /// Whether the call changes remote state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, GatewayCall::DescribeManaged { .. })
    }
}

#[derive(Default)]
struct Inner {
    calls: Vec<GatewayCall>,
    failures: HashMap<&'static str, VecDeque<GatewayError>>,
    load_balancers: BTreeMap<String, LoadBalancerDescription>,
    target_groups: BTreeMap<String, TargetGroupDescription>,
    /// listener arn → (load balancer arn, listener)
    listeners: BTreeMap<String, (String, ListenerDescription)>,
    /// rule arn → (listener arn, rule)
    rules: BTreeMap<String, (String, RuleDescription)>,
}

impl Inner {
    /// Record `call` and pop a primed failure for its operation, if any.
    fn record(&mut self, call: GatewayCall) -> Result<(), GatewayError> {
        let op = call.operation();
        self.calls.push(call);
        match self.failures.get_mut(op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn target_group_in_use(&self, arn: &str) -> bool {
        let by_rule = self
            .rules
            .values()
            .flat_map(|(_, r)| r.actions.iter())
            .any(|a| a.target_group_arn.as_deref() == Some(arn));
        let by_listener = self
            .listeners
            .values()
            .flat_map(|(_, l)| l.default_actions.iter())
            .any(|a| a.target_group_arn.as_deref() == Some(arn));
        by_rule || by_listener
    }
}

/// Thread-safe in-memory [`CloudGateway`].
#[derive(Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `operation` fail with `err`. Failures queue up per operation.
    pub async fn fail_next(&self, operation: &'static str, err: GatewayError) {
        let mut inner = self.inner.write().await;
        inner.failures.entry(operation).or_default().push_back(err);
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.inner.read().await.calls.clone()
    }

    /// Calls that change remote state.
    pub async fn mutations(&self) -> Vec<GatewayCall> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| c.is_mutation())
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.inner.write().await.calls.clear();
    }

    pub async fn load_balancer_count(&self) -> usize {
        self.inner.read().await.load_balancers.len()
    }

    pub async fn target_group_count(&self) -> usize {
        self.inner.read().await.target_groups.len()
    }

    pub async fn listener_count(&self) -> usize {
        self.inner.read().await.listeners.len()
    }

    /// Non-default rules currently attached to `listener_arn`, sorted by priority.
    pub async fn rules_of(&self, listener_arn: &str) -> Vec<RuleDescription> {
        let inner = self.inner.read().await;
        let mut rules: Vec<RuleDescription> = inner
            .rules
            .values()
            .filter(|(l, _)| l == listener_arn)
            .map(|(_, r)| r.clone())
            .collect();
        rules.sort_by_key(|r| r.priority);
        rules
    }
}

fn new_arn(kind: &str, name: &str) -> String {
    format!("arn:memory:elasticloadbalancing:{}/{}/{}", kind, name, Uuid::new_v4().simple())
}

#[async_trait]
impl CloudGateway for MemoryGateway {
    async fn create_load_balancer(
        &self,
        input: CreateLoadBalancerInput,
    ) -> Result<LoadBalancerDescription, GatewayError> {
        let mut inner = self.inner.write().await;
        inner.record(GatewayCall::CreateLoadBalancer {
            name: input.name.clone(),
        })?;
        if inner.load_balancers.values().any(|lb| lb.name == input.name) {
            return Err(GatewayError::Permanent(format!(
                "DuplicateLoadBalancerName: {}",
                input.name
            )));
        }
        let arn = new_arn("loadbalancer/app", &input.name);
        let lb = LoadBalancerDescription {
            load_balancer_arn: Some(arn.clone()),
            dns_name: Some(format!("{}.elb.memory.internal", input.name)),
            name: input.name,
            scheme: input.scheme,
            subnets: input.subnets,
            security_groups: input.security_groups,
            tags: input.tags,
        };
        info!("memory gateway: created load balancer {}", arn);
        inner.load_balancers.insert(arn, lb.clone());
        Ok(lb)
    }

    async fn delete_load_balancer(&self, load_balancer_arn: &str) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        inner.record(GatewayCall::DeleteLoadBalancer {
            arn: load_balancer_arn.to_string(),
        })?;
        if inner.listeners.values().any(|(lb, _)| lb == load_balancer_arn) {
            return Err(GatewayError::Permanent(format!(
                "ResourceInUse: load balancer {} still has listeners",
                load_balancer_arn
            )));
        }
        inner
            .load_balancers
            .remove(load_balancer_arn)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(load_balancer_arn.to_string()))
    }

    async fn create_target_group(
        &self,
        input: CreateTargetGroupInput,
    ) -> Result<TargetGroupDescription, GatewayError> {
        let mut inner = self.inner.write().await;
        inner.record(GatewayCall::CreateTargetGroup {
            name: input.name.clone(),
        })?;
        if inner.target_groups.values().any(|tg| tg.name == input.name) {
            return Err(GatewayError::Permanent(format!(
                "DuplicateTargetGroupName: {}",
                input.name
            )));
        }
        let arn = new_arn("targetgroup", &input.name);
        let tg = TargetGroupDescription {
            target_group_arn: Some(arn.clone()),
            name: input.name,
            port: input.port,
            protocol: input.protocol,
            vpc_id: input.vpc_id,
            tags: input.tags,
        };
        inner.target_groups.insert(arn, tg.clone());
        Ok(tg)
    }

    async fn delete_target_group(&self, target_group_arn: &str) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        inner.record(GatewayCall::DeleteTargetGroup {
            arn: target_group_arn.to_string(),
        })?;
        if inner.target_group_in_use(target_group_arn) {
            return Err(GatewayError::Permanent(format!(
                "ResourceInUse: target group {} is still referenced",
                target_group_arn
            )));
        }
        inner
            .target_groups
            .remove(target_group_arn)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(target_group_arn.to_string()))
    }

    async fn create_listener(
        &self,
        input: CreateListenerInput,
    ) -> Result<ListenerDescription, GatewayError> {
        let mut inner = self.inner.write().await;
        inner.record(GatewayCall::CreateListener {
            load_balancer_arn: input.load_balancer_arn.clone(),
            port: input.port,
        })?;
        if !inner.load_balancers.contains_key(&input.load_balancer_arn) {
            return Err(GatewayError::NotFound(input.load_balancer_arn));
        }
        let duplicate = inner
            .listeners
            .values()
            .any(|(lb, l)| lb == &input.load_balancer_arn && l.port == input.port);
        if duplicate {
            return Err(GatewayError::Permanent(format!(
                "DuplicateListener: port {}",
                input.port
            )));
        }
        let arn = new_arn("listener/app", &input.port.to_string());
        let listener = ListenerDescription {
            listener_arn: Some(arn.clone()),
            port: input.port,
            protocol: input.protocol,
            default_actions: input.default_actions,
        };
        inner
            .listeners
            .insert(arn, (input.load_balancer_arn, listener.clone()));
        Ok(listener)
    }

    async fn delete_listener(&self, listener_arn: &str) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        inner.record(GatewayCall::DeleteListener {
            arn: listener_arn.to_string(),
        })?;
        if inner.listeners.remove(listener_arn).is_none() {
            return Err(GatewayError::NotFound(listener_arn.to_string()));
        }
        // Rules go with their listener.
        inner.rules.retain(|_, (l, _)| l != listener_arn);
        Ok(())
    }

    async fn create_rule(&self, input: CreateRuleInput) -> Result<RuleDescription, GatewayError> {
        let mut inner = self.inner.write().await;
        inner.record(GatewayCall::CreateRule {
            listener_arn: input.listener_arn.clone(),
            priority: input.priority,
        })?;
        if !inner.listeners.contains_key(&input.listener_arn) {
            return Err(GatewayError::NotFound(input.listener_arn));
        }
        let taken = inner
            .rules
            .values()
            .any(|(l, r)| l == &input.listener_arn && r.priority == Some(input.priority));
        if taken {
            return Err(GatewayError::Permanent(format!(
                "PriorityInUse: {}",
                input.priority
            )));
        }
        let arn = new_arn("listener-rule/app", &input.priority.to_string());
        let rule = RuleDescription {
            rule_arn: Some(arn.clone()),
            priority: Some(input.priority),
            is_default: false,
            conditions: input.conditions,
            actions: input.actions,
        };
        inner.rules.insert(arn, (input.listener_arn, rule.clone()));
        Ok(rule)
    }

    async fn modify_rule(&self, input: ModifyRuleInput) -> Result<RuleDescription, GatewayError> {
        let mut inner = self.inner.write().await;
        inner.record(GatewayCall::ModifyRule {
            arn: input.rule_arn.clone(),
        })?;
        match inner.rules.get_mut(&input.rule_arn) {
            Some((_, rule)) => {
                rule.conditions = input.conditions;
                rule.actions = input.actions;
                Ok(rule.clone())
            }
            None => Err(GatewayError::NotFound(input.rule_arn)),
        }
    }

    async fn delete_rule(&self, rule_arn: &str) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        inner.record(GatewayCall::DeleteRule {
            arn: rule_arn.to_string(),
        })?;
        inner
            .rules
            .remove(rule_arn)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(rule_arn.to_string()))
    }

    async fn describe_managed(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<ManagedLoadBalancer>, GatewayError> {
        let mut inner = self.inner.write().await;
        inner.record(GatewayCall::DescribeManaged {
            cluster_name: cluster_name.to_string(),
        })?;

        let mut trees = Vec::new();
        for (lb_arn, lb) in &inner.load_balancers {
            if tag_value(&lb.tags, TAG_CLUSTER_NAME) != Some(cluster_name) {
                continue;
            }
            let listeners = inner
                .listeners
                .iter()
                .filter(|(_, (owner, _))| owner == lb_arn)
                .map(|(l_arn, (_, listener))| {
                    let mut rules: Vec<RuleDescription> = inner
                        .rules
                        .values()
                        .filter(|(owner, _)| owner == l_arn)
                        .map(|(_, r)| r.clone())
                        .collect();
                    rules.sort_by_key(|r| r.priority);
                    // The remote API reports the listener default as a rule of its own.
                    rules.push(RuleDescription {
                        rule_arn: None,
                        priority: None,
                        is_default: true,
                        conditions: Vec::new(),
                        actions: listener.default_actions.clone(),
                    });
                    ManagedListener {
                        listener: listener.clone(),
                        rules,
                    }
                })
                .collect();

            // Target groups are matched to their load balancer through shared tags.
            let target_groups = inner
                .target_groups
                .values()
                .filter(|tg| {
                    lb.tags
                        .iter()
                        .all(|t| tag_value(&tg.tags, &t.key) == Some(t.value.as_str()))
                })
                .cloned()
                .collect();

            trees.push(ManagedLoadBalancer {
                load_balancer: lb.clone(),
                listeners,
                target_groups,
            });
        }
        Ok(trees)
    }
}
