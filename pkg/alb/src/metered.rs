use async_trait::async_trait;
use std::sync::Arc;

use pkg_cloud::model::{
    CreateListenerInput, CreateLoadBalancerInput, CreateRuleInput, CreateTargetGroupInput,
    ListenerDescription, LoadBalancerDescription, ManagedLoadBalancer, ModifyRuleInput,
    RuleDescription, TargetGroupDescription,
};
use pkg_cloud::{CloudGateway, GatewayError};
use pkg_metrics::{MetricsRegistry, names};

/// Gateway wrapper that counts every call, and every failed call, per operation.
pub struct MeteredGateway {
    inner: Arc<dyn CloudGateway>,
    metrics: Arc<MetricsRegistry>,
}

impl MeteredGateway {
    pub fn new(inner: Arc<dyn CloudGateway>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { inner, metrics }
    }

    fn observe<T>(
        &self,
        operation: &str,
        result: Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let labels = [("operation", operation)];
        self.metrics
            .counter_inc_with(names::REMOTE_CALLS_TOTAL, &labels);
        if result.is_err() {
            self.metrics
                .counter_inc_with(names::REMOTE_CALL_FAILURES_TOTAL, &labels);
        }
        result
    }
}

#[async_trait]
impl CloudGateway for MeteredGateway {
    async fn create_load_balancer(
        &self,
        input: CreateLoadBalancerInput,
    ) -> Result<LoadBalancerDescription, GatewayError> {
        let result = self.inner.create_load_balancer(input).await;
        self.observe("create_load_balancer", result)
    }

    async fn delete_load_balancer(&self, load_balancer_arn: &str) -> Result<(), GatewayError> {
        let result = self.inner.delete_load_balancer(load_balancer_arn).await;
        self.observe("delete_load_balancer", result)
    }

    async fn create_target_group(
        &self,
        input: CreateTargetGroupInput,
    ) -> Result<TargetGroupDescription, GatewayError> {
        let result = self.inner.create_target_group(input).await;
        self.observe("create_target_group", result)
    }

    async fn delete_target_group(&self, target_group_arn: &str) -> Result<(), GatewayError> {
        let result = self.inner.delete_target_group(target_group_arn).await;
        self.observe("delete_target_group", result)
    }

    async fn create_listener(
        &self,
        input: CreateListenerInput,
    ) -> Result<ListenerDescription, GatewayError> {
        let result = self.inner.create_listener(input).await;
        self.observe("create_listener", result)
    }

    async fn delete_listener(&self, listener_arn: &str) -> Result<(), GatewayError> {
        let result = self.inner.delete_listener(listener_arn).await;
        self.observe("delete_listener", result)
    }

    async fn create_rule(&self, input: CreateRuleInput) -> Result<RuleDescription, GatewayError> {
        let result = self.inner.create_rule(input).await;
        self.observe("create_rule", result)
    }

    async fn modify_rule(&self, input: ModifyRuleInput) -> Result<RuleDescription, GatewayError> {
        let result = self.inner.modify_rule(input).await;
        self.observe("modify_rule", result)
    }

    async fn delete_rule(&self, rule_arn: &str) -> Result<(), GatewayError> {
        let result = self.inner.delete_rule(rule_arn).await;
        self.observe("delete_rule", result)
    }

    async fn describe_managed(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<ManagedLoadBalancer>, GatewayError> {
        let result = self.inner.describe_managed(cluster_name).await;
        self.observe("describe_managed", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_cloud::MemoryGateway;

    #[tokio::test]
    async fn test_counts_calls_and_failures() {
        let memory = MemoryGateway::new();
        let metrics = Arc::new(MetricsRegistry::controller());
        let gw = MeteredGateway::new(Arc::new(memory.clone()), metrics.clone());

        memory
            .fail_next("delete_rule", GatewayError::Transient("throttled".to_string()))
            .await;
        assert!(gw.delete_rule("arn:rule/1").await.is_err());
        assert!(gw.describe_managed("c1").await.is_ok());

        let delete = [("operation", "delete_rule")];
        let describe = [("operation", "describe_managed")];
        assert_eq!(metrics.value(names::REMOTE_CALLS_TOTAL, &delete), 1);
        assert_eq!(metrics.value(names::REMOTE_CALL_FAILURES_TOTAL, &delete), 1);
        assert_eq!(metrics.value(names::REMOTE_CALLS_TOTAL, &describe), 1);
        assert_eq!(metrics.value(names::REMOTE_CALL_FAILURES_TOTAL, &describe), 0);
    }
}
