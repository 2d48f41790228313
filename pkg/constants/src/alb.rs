//! Load balancer resource constants.

/// Ingress class served when none is configured.
pub const DEFAULT_INGRESS_CLASS: &str = "alb";

/// Longest cluster name accepted. Resource names are `<cluster>-<hash>`
/// and must fit in `MAX_RESOURCE_NAME_LEN`.
pub const MAX_CLUSTER_NAME_LEN: usize = 11;

/// Remote API limit on load balancer and target group names.
pub const MAX_RESOURCE_NAME_LEN: usize = 32;

/// Priority handed to the first non-default rule of a fresh load balancer.
pub const FIRST_RULE_PRIORITY: i64 = 1;

/// Path that maps to a listener's default rule.
pub const DEFAULT_RULE_PATH: &str = "/";

/// Condition field used for path based rules.
pub const PATH_PATTERN_FIELD: &str = "path-pattern";

/// Default load balancer scheme.
pub const DEFAULT_SCHEME: &str = "internet-facing";

/// Tag carrying the owning cluster name.
pub const TAG_CLUSTER_NAME: &str = "ClusterName";

/// Tag carrying the owning Ingress identifier (`namespace/name`).
pub const TAG_INGRESS_NAME: &str = "IngressName";

/// Tag carrying the backend service of a target group.
pub const TAG_SERVICE_NAME: &str = "ServiceName";

/// Default interval between sync cycles, in seconds.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
