//! Ingress annotation keys understood by the controller.

/// Ingress class selector. Ingresses whose class does not match are ignored.
pub const INGRESS_CLASS: &str = "kubernetes.io/ingress.class";

/// `internet-facing` (default) or `internal`.
pub const SCHEME: &str = "alb.ingress.kubernetes.io/scheme";

/// Comma-separated subnet ids for the load balancer.
pub const SUBNETS: &str = "alb.ingress.kubernetes.io/subnets";

/// Comma-separated security group ids for the load balancer.
pub const SECURITY_GROUPS: &str = "alb.ingress.kubernetes.io/security-groups";

/// Comma-separated listener ports, e.g. `80,8080`.
pub const LISTEN_PORTS: &str = "alb.ingress.kubernetes.io/listen-ports";
