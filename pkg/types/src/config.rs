use serde::{Deserialize, Serialize};

/// Controller configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// cluster-name: prod-east
/// ingress-class: alb
/// server: http://10.0.0.1:6443
/// token: my-secret-token
/// cloud-endpoint: https://elb.internal:8443
/// vpc-id: vpc-0a1b2c
/// sync-interval: 30
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigFile {
    #[serde(default, alias = "cluster-name")]
    pub cluster_name: Option<String>,
    #[serde(default, alias = "ingress-class")]
    pub ingress_class: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, alias = "cloud-endpoint")]
    pub cloud_endpoint: Option<String>,
    #[serde(default, alias = "cloud-token")]
    pub cloud_token: Option<String>,
    #[serde(default, alias = "vpc-id")]
    pub vpc_id: Option<String>,
    #[serde(default, alias = "sync-interval")]
    pub sync_interval: Option<u64>,
    #[serde(default, alias = "log-level")]
    pub log_level: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
