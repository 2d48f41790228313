//! Desired load balancer trees, rebuilt from the Ingress list every cycle.

use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use pkg_cloud::model::{
    ListenerDescription, LoadBalancerDescription, RuleAction, RuleDescription,
    TargetGroupDescription,
};
use pkg_constants::alb::DEFAULT_SCHEME;
use pkg_constants::annotations;
use pkg_constants::network::{DEFAULT_LISTENER_PORT, DEFAULT_PROTOCOL};
use pkg_types::ingress::Ingress;

use crate::error::ReconcileError;
use crate::naming;
use crate::rule::desired_for_path;

const SCHEMES: &[&str] = &["internet-facing", "internal"];

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredRule {
    pub svc_name: String,
    pub description: RuleDescription,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredListener {
    pub description: ListenerDescription,
    pub rules: Vec<DesiredRule>,
}

impl DesiredListener {
    /// Service of the path mapped to the listener default, if any.
    pub fn default_service(&self) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.description.is_default)
            .map(|r| r.svc_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredTargetGroup {
    pub svc_name: String,
    pub description: TargetGroupDescription,
}

/// Everything one Ingress asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredLoadBalancer {
    pub ingress_id: String,
    pub description: LoadBalancerDescription,
    pub listeners: Vec<DesiredListener>,
    /// One per distinct backend service, in order of first reference.
    pub target_groups: Vec<DesiredTargetGroup>,
}

/// Inputs that shape every desired tree besides the Ingress itself.
#[derive(Debug, Clone)]
pub struct TreeOptions {
    pub cluster_name: String,
    /// Empty accepts every Ingress.
    pub ingress_class: String,
    pub vpc_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct DesiredIngressTree {
    pub load_balancers: Vec<DesiredLoadBalancer>,
    /// Ingresses of our class that could not be turned into a tree.
    pub invalid: Vec<ReconcileError>,
}

impl DesiredIngressTree {
    /// Build the desired trees for every Ingress of the configured class.
    pub fn build(ingresses: &[Ingress], options: &TreeOptions) -> Self {
        let mut tree = Self::default();
        let mut seen = HashSet::new();

        for ingress in ingresses {
            if !ingress.matches_class(&options.ingress_class) {
                debug!(
                    "Ingress {}: class {:?} not handled, ignoring",
                    ingress.ingress_id(),
                    ingress.ingress_class()
                );
                continue;
            }
            let ingress_id = ingress.ingress_id();
            if !seen.insert(ingress_id.clone()) {
                warn!("Ingress {}: listed twice, keeping the first", ingress_id);
                continue;
            }
            match desired_load_balancer(ingress, options) {
                Ok(lb) => tree.load_balancers.push(lb),
                Err(reason) => {
                    warn!("Ingress {}: skipped: {}", ingress_id, reason);
                    tree.invalid.push(ReconcileError::InvalidIngress { ingress_id, reason });
                }
            }
        }
        tree
    }

    /// Identifiers of Ingresses that were skipped as invalid.
    pub fn invalid_ids(&self) -> Vec<&str> {
        self.invalid
            .iter()
            .filter_map(|e| match e {
                ReconcileError::InvalidIngress { ingress_id, .. } => Some(ingress_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_ports(value: Option<&str>) -> Result<Vec<u16>, String> {
    let Some(value) = value else {
        return Ok(vec![DEFAULT_LISTENER_PORT]);
    };
    let mut ports = Vec::new();
    for raw in split_list(Some(value)) {
        let port: u16 = raw
            .parse()
            .map_err(|_| format!("invalid listen port '{}'", raw))?;
        if port == 0 {
            return Err("listen port 0 is not allowed".to_string());
        }
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    if ports.is_empty() {
        return Err("listen-ports annotation names no port".to_string());
    }
    Ok(ports)
}

fn desired_load_balancer(
    ingress: &Ingress,
    options: &TreeOptions,
) -> Result<DesiredLoadBalancer, String> {
    let ingress_id = ingress.ingress_id();

    let scheme = ingress
        .annotation(annotations::SCHEME)
        .unwrap_or(DEFAULT_SCHEME);
    if !SCHEMES.contains(&scheme) {
        return Err(format!("unknown scheme '{}'", scheme));
    }
    let ports = parse_ports(ingress.annotation(annotations::LISTEN_PORTS))?;

    // First occurrence of a path wins; a rule is keyed by its path within a listener.
    let mut rules: Vec<DesiredRule> = Vec::new();
    let mut target_groups: BTreeMap<String, DesiredTargetGroup> = BTreeMap::new();
    let mut service_order: Vec<String> = Vec::new();
    for path in ingress.spec.http_paths() {
        let description = desired_for_path(&path.path);
        if rules.iter().any(|r| r.description == description) {
            debug!("Ingress {}: duplicate path {} ignored", ingress_id, path.path);
            continue;
        }
        let svc = &path.backend.service_name;
        if !target_groups.contains_key(svc) {
            service_order.push(svc.clone());
            target_groups.insert(
                svc.clone(),
                DesiredTargetGroup {
                    svc_name: svc.clone(),
                    description: TargetGroupDescription {
                        target_group_arn: None,
                        name: naming::target_group_name(&options.cluster_name, &ingress_id, svc),
                        port: path.backend.service_port,
                        protocol: DEFAULT_PROTOCOL.to_string(),
                        vpc_id: options.vpc_id.clone(),
                        tags: naming::target_group_tags(&options.cluster_name, &ingress_id, svc),
                    },
                },
            );
        }
        rules.push(DesiredRule {
            svc_name: svc.clone(),
            description,
        });
    }
    if rules.is_empty() {
        return Err("no HTTP paths".to_string());
    }

    let listeners = ports
        .into_iter()
        .map(|port| DesiredListener {
            description: ListenerDescription {
                listener_arn: None,
                port,
                protocol: DEFAULT_PROTOCOL.to_string(),
                default_actions: vec![RuleAction::forward(None)],
            },
            rules: rules.clone(),
        })
        .collect();

    Ok(DesiredLoadBalancer {
        description: LoadBalancerDescription {
            load_balancer_arn: None,
            name: naming::load_balancer_name(&options.cluster_name, &ingress_id),
            scheme: scheme.to_string(),
            subnets: split_list(ingress.annotation(annotations::SUBNETS)),
            security_groups: split_list(ingress.annotation(annotations::SECURITY_GROUPS)),
            dns_name: None,
            tags: naming::load_balancer_tags(&options.cluster_name, &ingress_id),
        },
        ingress_id,
        listeners,
        target_groups: service_order
            .iter()
            .filter_map(|svc| target_groups.remove(svc))
            .collect(),
    })
}
