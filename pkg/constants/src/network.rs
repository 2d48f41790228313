//! Network-related constants.

/// Default k3rs API server address the Ingress lister talks to.
pub const DEFAULT_API_ADDR: &str = "http://127.0.0.1:6443";

/// Default join/bearer token for the k3rs API server.
pub const DEFAULT_API_TOKEN: &str = "demo-token-123";

/// Port a Listener binds when an Ingress does not ask for any.
pub const DEFAULT_LISTENER_PORT: u16 = 80;

/// Protocol used for Listeners and Target Groups.
pub const DEFAULT_PROTOCOL: &str = "HTTP";

/// Timeout applied to every cloud API request, in seconds.
pub const CLOUD_REQUEST_TIMEOUT_SECS: u64 = 30;
