mod registry;

use anyhow::anyhow;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pkg_alb::{Engine, EngineConfig};
use pkg_cloud::{CloudGateway, HttpGateway, MemoryGateway};
use pkg_constants::alb::{DEFAULT_INGRESS_CLASS, DEFAULT_SYNC_INTERVAL_SECS};
use pkg_constants::network::{DEFAULT_API_ADDR, DEFAULT_API_TOKEN};
use pkg_constants::paths::DEFAULT_CONTROLLER_CONFIG;
use pkg_metrics::MetricsRegistry;
use pkg_types::config::{ControllerConfigFile, load_config_file};
use pkg_types::validate::validate_cluster_name;

use crate::registry::IngressLister;

#[derive(Parser, Debug)]
#[command(
    name = "alb-controller",
    about = "Reconciles Ingress resources into application load balancers"
)]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONTROLLER_CONFIG)]
    config: String,

    /// Cluster name, prefixed to every load balancer and target group (max 11 chars)
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Ingress class to serve; an empty value serves every Ingress
    #[arg(long, env = "INGRESS_CLASS")]
    ingress_class: Option<String>,

    /// k3rs API server endpoint
    #[arg(long)]
    server: Option<String>,

    /// Bearer token for the k3rs API server
    #[arg(long)]
    token: Option<String>,

    /// Load balancer API endpoint
    #[arg(long, env = "ALB_ENDPOINT")]
    cloud_endpoint: Option<String>,

    /// Bearer token for the load balancer API
    #[arg(long, env = "ALB_TOKEN")]
    cloud_token: Option<String>,

    /// VPC the target groups are created in
    #[arg(long)]
    vpc_id: Option<String>,

    /// Seconds between sync cycles
    #[arg(long)]
    sync_interval: Option<u64>,

    /// Log filter, e.g. `info` or `pkg_alb=debug`
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Log every cloud API request
    #[arg(long, env = "AWS_DEBUG")]
    cloud_debug: bool,

    /// Reconcile against an in-memory gateway instead of the cloud API
    #[arg(long)]
    dry_run: bool,

    /// Run a single sync cycle and exit
    #[arg(long)]
    once: bool,
}

/// Settings after merging CLI (and environment) > config file > defaults.
#[derive(Debug)]
struct Settings {
    cluster_name: String,
    ingress_class: String,
    server: String,
    token: String,
    cloud_endpoint: Option<String>,
    cloud_token: Option<String>,
    vpc_id: Option<String>,
    sync_interval: u64,
    log_level: String,
}

impl Settings {
    fn merge(cli: &Cli, file: ControllerConfigFile) -> anyhow::Result<Self> {
        let cluster_name = cli
            .cluster_name
            .clone()
            .or(file.cluster_name)
            .ok_or_else(|| anyhow!("--cluster-name (or CLUSTER_NAME) is required"))?;
        validate_cluster_name(&cluster_name)?;

        let cloud_endpoint = cli.cloud_endpoint.clone().or(file.cloud_endpoint);
        if cloud_endpoint.is_none() && !cli.dry_run {
            return Err(anyhow!(
                "--cloud-endpoint (or ALB_ENDPOINT) is required unless --dry-run is set"
            ));
        }

        let sync_interval = cli
            .sync_interval
            .or(file.sync_interval)
            .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS);
        if sync_interval == 0 {
            return Err(anyhow!("--sync-interval must be at least 1 second"));
        }

        Ok(Self {
            cluster_name,
            ingress_class: cli
                .ingress_class
                .clone()
                .or(file.ingress_class)
                .unwrap_or_else(|| DEFAULT_INGRESS_CLASS.to_string()),
            server: cli
                .server
                .clone()
                .or(file.server)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            token: cli
                .token
                .clone()
                .or(file.token)
                .unwrap_or_else(|| DEFAULT_API_TOKEN.to_string()),
            cloud_endpoint,
            cloud_token: cli.cloud_token.clone().or(file.cloud_token),
            vpc_id: cli.vpc_id.clone().or(file.vpc_id),
            sync_interval,
            log_level: cli
                .log_level
                .clone()
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ControllerConfigFile = load_config_file(&cli.config)?;
    let settings = Settings::merge(&cli, file_cfg)?;
    init_tracing(&settings.log_level, cli.log_json);

    info!("Starting alb-controller");
    info!("  Config:        {}", cli.config);
    info!("  Cluster:       {}", settings.cluster_name);
    info!("  Ingress class: {:?}", settings.ingress_class);
    info!("  API server:    {}", settings.server);
    info!("  Sync interval: {}s", settings.sync_interval);

    let gateway: Arc<dyn CloudGateway> = match &settings.cloud_endpoint {
        Some(endpoint) if !cli.dry_run => {
            info!("  Cloud API:     {}", endpoint);
            Arc::new(HttpGateway::new(
                endpoint,
                settings.cloud_token.clone(),
                cli.cloud_debug,
            )?)
        }
        _ => {
            warn!("Dry run: load balancers are only created in memory");
            Arc::new(MemoryGateway::new())
        }
    };

    let metrics = Arc::new(MetricsRegistry::controller());
    let mut engine = Engine::new(
        gateway,
        EngineConfig {
            cluster_name: settings.cluster_name.clone(),
            ingress_class: settings.ingress_class.clone(),
            vpc_id: settings.vpc_id.clone(),
        },
        metrics.clone(),
    );
    engine.resume().await?;

    let lister = IngressLister::new(&settings.server, &settings.token)?;
    let mut interval = tokio::time::interval(Duration::from_secs(settings.sync_interval));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down alb-controller");
                break;
            }
        }

        // A failed listing must not be mistaken for "no Ingresses": that would sweep everything.
        let ingresses = match lister.list_ingresses().await {
            Ok(list) => list,
            Err(e) => {
                error!("Failed to list ingresses, skipping cycle: {:#}", e);
                if cli.once {
                    return Err(e);
                }
                continue;
            }
        };

        let report = engine.sync(&ingresses).await;
        for warning in &report.warnings {
            warn!("{}", warning);
        }
        for failure in &report.failures {
            error!("{}: {}", failure.entity, failure.error);
        }
        for id in &report.reconciled {
            if let Some(dns) = engine.load_balancer(id).and_then(|lb| lb.dns_name()) {
                debug!("Ingress {} served by {}", id, dns);
            }
        }
        info!("Sync: {}", report);
        debug!("Metrics:\n{}", metrics.render());

        if cli.once {
            if !report.is_success() {
                return Err(anyhow!("sync finished with {} failures", report.failures.len()));
            }
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cli(args: &[&str]) -> Cli {
        let mut argv = vec!["alb-controller"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = make_cli(&["--cluster-name", "prod", "--sync-interval", "5", "--dry-run"]);
        let file = ControllerConfigFile {
            cluster_name: Some("staging".to_string()),
            sync_interval: Some(60),
            vpc_id: Some("vpc-file".to_string()),
            ..Default::default()
        };
        let settings = Settings::merge(&cli, file).unwrap();
        assert_eq!(settings.cluster_name, "prod");
        assert_eq!(settings.sync_interval, 5);
        assert_eq!(settings.vpc_id.as_deref(), Some("vpc-file"));
        assert_eq!(settings.ingress_class, DEFAULT_INGRESS_CLASS);
        assert_eq!(settings.server, DEFAULT_API_ADDR);
    }

    #[test]
    fn test_endpoint_required_without_dry_run() {
        let cli = make_cli(&["--cluster-name", "prod"]);
        assert!(Settings::merge(&cli, ControllerConfigFile::default()).is_err());

        let file = ControllerConfigFile {
            cloud_endpoint: Some("http://elb.local".to_string()),
            ..Default::default()
        };
        assert!(Settings::merge(&cli, file).is_ok());
    }

    #[test]
    fn test_cluster_name_is_validated() {
        let cli = make_cli(&["--cluster-name", "much-too-long-name", "--dry-run"]);
        assert!(Settings::merge(&cli, ControllerConfigFile::default()).is_err());
    }
}
