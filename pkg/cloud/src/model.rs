use serde::{Deserialize, Serialize};

use pkg_constants::alb::PATH_PATTERN_FIELD;

/// Key/value tag attached to a remote resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Look up the value of tag `key`.
pub fn tag_value<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.key == key)
        .map(|t| t.value.as_str())
}

/// A single match condition of a rule, e.g. `path-pattern = ["/api"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub values: Vec<String>,
}

impl RuleCondition {
    pub fn path_pattern(path: &str) -> Self {
        Self {
            field: PATH_PATTERN_FIELD.to_string(),
            values: vec![path.to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Forward,
}

/// Forwarding action of a rule or a listener default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// `None` until the target group has been resolved. Desired states built from an
    /// Ingress never know the ARN; create and modify fill it in.
    #[serde(default)]
    pub target_group_arn: Option<String>,
}

impl RuleAction {
    pub fn forward(target_group_arn: Option<String>) -> Self {
        Self {
            action_type: ActionType::Forward,
            target_group_arn,
        }
    }
}

/// Snapshot of a listener rule.
///
/// The same shape is used for the desired state derived from an Ingress path
/// and for the remote state returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDescription {
    /// Remote identifier. `None` for desired states and for default rules,
    /// which have no independent remote existence.
    #[serde(default)]
    pub rule_arn: Option<String>,
    /// `None` for a default rule. Non-default rules always carry a priority once created.
    #[serde(default)]
    pub priority: Option<i64>,
    pub is_default: bool,
    /// Empty for the default rule; exactly one path-pattern condition otherwise.
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerDescription {
    /// `None` until created.
    #[serde(default)]
    pub load_balancer_arn: Option<String>,
    pub name: String,
    pub scheme: String,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Assigned by the remote API on creation.
    #[serde(default)]
    pub dns_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerDescription {
    /// `None` until created.
    #[serde(default)]
    pub listener_arn: Option<String>,
    pub port: u16,
    pub protocol: String,
    #[serde(default)]
    pub default_actions: Vec<RuleAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupDescription {
    /// `None` until created.
    #[serde(default)]
    pub target_group_arn: Option<String>,
    pub name: String,
    pub port: u16,
    pub protocol: String,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLoadBalancerInput {
    pub name: String,
    pub scheme: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTargetGroupInput {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    pub vpc_id: Option<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateListenerInput {
    pub load_balancer_arn: String,
    pub port: u16,
    pub protocol: String,
    pub default_actions: Vec<RuleAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRuleInput {
    pub listener_arn: String,
    pub priority: i64,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyRuleInput {
    pub rule_arn: String,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
}

/// A listener together with its rules, as found remotely.
/// `rules` includes the listener's default rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedListener {
    pub listener: ListenerDescription,
    #[serde(default)]
    pub rules: Vec<RuleDescription>,
}

/// A complete remote tree previously created for one Ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedLoadBalancer {
    pub load_balancer: LoadBalancerDescription,
    #[serde(default)]
    pub listeners: Vec<ManagedListener>,
    #[serde(default)]
    pub target_groups: Vec<TargetGroupDescription>,
}
