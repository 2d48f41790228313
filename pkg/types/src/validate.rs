use anyhow::{Result, bail};

use pkg_constants::alb::MAX_CLUSTER_NAME_LEN;

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Validate the cluster name that prefixes every remote resource name.
pub fn validate_cluster_name(name: &str) -> Result<()> {
    validate_name(name)?;
    if name.len() > MAX_CLUSTER_NAME_LEN {
        bail!(
            "cluster name '{}' must be {} characters or less (got {})",
            name,
            MAX_CLUSTER_NAME_LEN,
            name.len()
        );
    }
    Ok(())
}
