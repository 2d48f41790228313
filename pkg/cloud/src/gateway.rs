use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    CreateListenerInput, CreateLoadBalancerInput, CreateRuleInput, CreateTargetGroupInput,
    ListenerDescription, LoadBalancerDescription, ManagedLoadBalancer, ModifyRuleInput,
    RuleDescription, TargetGroupDescription,
};

/// Failure of a single remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The addressed resource does not exist. Deletes treat this as success.
    #[error("{0} not found")]
    NotFound(String),

    /// Throttling, timeouts, 5xx. Worth retrying on a later cycle.
    #[error("transient cloud API failure: {0}")]
    Transient(String),

    /// The request was rejected and will be rejected again as-is.
    #[error("cloud API rejected request: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Remote operations the reconcilers need. Identifiers are the ARNs returned by the
/// create calls. Retries and backoff are the implementation's business.
#[async_trait]
pub trait CloudGateway: Send + Sync {
    async fn create_load_balancer(
        &self,
        input: CreateLoadBalancerInput,
    ) -> Result<LoadBalancerDescription, GatewayError>;

    async fn delete_load_balancer(&self, load_balancer_arn: &str) -> Result<(), GatewayError>;

    async fn create_target_group(
        &self,
        input: CreateTargetGroupInput,
    ) -> Result<TargetGroupDescription, GatewayError>;

    async fn delete_target_group(&self, target_group_arn: &str) -> Result<(), GatewayError>;

    async fn create_listener(
        &self,
        input: CreateListenerInput,
    ) -> Result<ListenerDescription, GatewayError>;

    async fn delete_listener(&self, listener_arn: &str) -> Result<(), GatewayError>;

    async fn create_rule(&self, input: CreateRuleInput) -> Result<RuleDescription, GatewayError>;

    async fn modify_rule(&self, input: ModifyRuleInput) -> Result<RuleDescription, GatewayError>;

    async fn delete_rule(&self, rule_arn: &str) -> Result<(), GatewayError>;

    /// Every tree tagged with `cluster_name`, used to resume after a restart.
    async fn describe_managed(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<ManagedLoadBalancer>, GatewayError>;
}
