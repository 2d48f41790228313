use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::info;

use pkg_constants::network::CLOUD_REQUEST_TIMEOUT_SECS;

use crate::gateway::{CloudGateway, GatewayError};
use crate::model::{
    CreateListenerInput, CreateLoadBalancerInput, CreateRuleInput, CreateTargetGroupInput,
    ListenerDescription, LoadBalancerDescription, ManagedLoadBalancer, ModifyRuleInput,
    RuleDescription, TargetGroupDescription,
};

/// Gateway speaking JSON over HTTP to an ELBv2-style endpoint.
///
/// Resources live under `/loadbalancers`, `/targetgroups`, `/listeners` and `/rules`;
/// identifiers are path segments. `/managed?cluster=<name>` returns whole trees.
pub struct HttpGateway {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    debug: bool,
}

impl HttpGateway {
    pub fn new(endpoint: &str, token: Option<String>, debug: bool) -> Result<Self, GatewayError> {
        let base = Url::parse(endpoint)
            .map_err(|e| GatewayError::Permanent(format!("invalid endpoint {}: {}", endpoint, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CLOUD_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::Permanent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base,
            token,
            debug,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                GatewayError::Permanent(format!("endpoint {} cannot be a base", self.base))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<reqwest::Response, GatewayError> {
        if self.debug {
            let payload = body
                .and_then(|b| serde_json::to_string(b).ok())
                .unwrap_or_default();
            info!("cloud API {} {} {}", method, url, payload);
        }

        let mut req = self.client.request(method, url.clone());
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(classify_transport)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify_status(status, url.path(), &text))
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<T, GatewayError> {
        let resp = self.send(method, url, body).await?;
        resp.json::<T>()
            .await
            .map_err(|e| GatewayError::Permanent(format!("malformed response: {}", e)))
    }

    async fn delete(&self, url: Url) -> Result<(), GatewayError> {
        self.send::<()>(Method::DELETE, url, None).await.map(|_| ())
    }
}

fn classify_transport(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() || e.is_connect() {
        GatewayError::Transient(e.to_string())
    } else {
        GatewayError::Permanent(e.to_string())
    }
}

fn classify_status(status: StatusCode, path: &str, body: &str) -> GatewayError {
    match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(path.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            GatewayError::Transient(format!("{} {}", status, body))
        }
        s if s.is_server_error() => GatewayError::Transient(format!("{} {}", status, body)),
        _ => GatewayError::Permanent(format!("{} {}", status, body)),
    }
}

#[async_trait]
impl CloudGateway for HttpGateway {
    async fn create_load_balancer(
        &self,
        input: CreateLoadBalancerInput,
    ) -> Result<LoadBalancerDescription, GatewayError> {
        let url = self.url(&["loadbalancers"])?;
        self.call(Method::POST, url, Some(&input)).await
    }

    async fn delete_load_balancer(&self, load_balancer_arn: &str) -> Result<(), GatewayError> {
        let url = self.url(&["loadbalancers", load_balancer_arn])?;
        self.delete(url).await
    }

    async fn create_target_group(
        &self,
        input: CreateTargetGroupInput,
    ) -> Result<TargetGroupDescription, GatewayError> {
        let url = self.url(&["targetgroups"])?;
        self.call(Method::POST, url, Some(&input)).await
    }

    async fn delete_target_group(&self, target_group_arn: &str) -> Result<(), GatewayError> {
        let url = self.url(&["targetgroups", target_group_arn])?;
        self.delete(url).await
    }

    async fn create_listener(
        &self,
        input: CreateListenerInput,
    ) -> Result<ListenerDescription, GatewayError> {
        let url = self.url(&["listeners"])?;
        self.call(Method::POST, url, Some(&input)).await
    }

    async fn delete_listener(&self, listener_arn: &str) -> Result<(), GatewayError> {
        let url = self.url(&["listeners", listener_arn])?;
        self.delete(url).await
    }

    async fn create_rule(&self, input: CreateRuleInput) -> Result<RuleDescription, GatewayError> {
        let url = self.url(&["rules"])?;
        self.call(Method::POST, url, Some(&input)).await
    }

    async fn modify_rule(&self, input: ModifyRuleInput) -> Result<RuleDescription, GatewayError> {
        let url = self.url(&["rules", &input.rule_arn])?;
        self.call(Method::PUT, url, Some(&input)).await
    }

    async fn delete_rule(&self, rule_arn: &str) -> Result<(), GatewayError> {
        let url = self.url(&["rules", rule_arn])?;
        self.delete(url).await
    }

    async fn describe_managed(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<ManagedLoadBalancer>, GatewayError> {
        let mut url = self.url(&["managed"])?;
        url.query_pairs_mut().append_pair("cluster", cluster_name);
        self.call::<(), _>(Method::GET, url, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::NOT_FOUND, "/rules/x", "").is_not_found());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "/rules", "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "/rules", "").is_transient());
        let rejected = classify_status(StatusCode::BAD_REQUEST, "/rules", "PriorityInUse");
        assert!(!rejected.is_transient());
        assert!(!rejected.is_not_found());
    }

    #[test]
    fn test_identifiers_are_escaped_as_one_segment() {
        let gw = HttpGateway::new("http://elb.local:8080/v1/", None, false).unwrap();
        let url = gw
            .url(&["rules", "arn:aws:elb:rule/app/lb/1/2"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://elb.local:8080/v1/rules/arn:aws:elb:rule%2Fapp%2Flb%2F1%2F2"
        );
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        assert!(HttpGateway::new("not a url", None, false).is_err());
    }
}
