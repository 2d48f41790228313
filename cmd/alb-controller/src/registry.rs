use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use pkg_types::ingress::Ingress;

/// The part of a namespace object the lister needs.
#[derive(Debug, Deserialize)]
struct NamespaceRef {
    name: String,
}

/// Lists Ingresses from the k3rs API server.
pub struct IngressLister {
    client: reqwest::Client,
    server: String,
    token: String,
}

impl IngressLister {
    pub fn new(server: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .with_context(|| format!("GET {} failed. Is k3rs-server running?", url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("GET {} returned {}: {}", url, status, body);
        }
        resp.json()
            .await
            .with_context(|| format!("GET {}: malformed response", url))
    }

    /// Every Ingress across all namespaces.
    pub async fn list_ingresses(&self) -> Result<Vec<Ingress>> {
        let namespaces: Vec<NamespaceRef> = self.get("/api/v1/namespaces").await?;
        let mut ingresses = Vec::new();
        for ns in namespaces {
            let mut found: Vec<Ingress> = self
                .get(&format!("/api/v1/namespaces/{}/ingresses", ns.name))
                .await?;
            debug!("Namespace {}: {} ingresses", ns.name, found.len());
            ingresses.append(&mut found);
        }
        Ok(ingresses)
    }
}
