//! Filesystem path constants.

/// Default config file path for the controller.
pub const DEFAULT_CONTROLLER_CONFIG: &str = "/etc/alb-ingress/config.yaml";
