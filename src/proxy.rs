//! Reverse-proxy route reconciliation through the Caddy admin API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

pub const SERVER_NAME: &str = "nixopus";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOptions {
    /// Dial the upstream over TLS.
    pub upstream_tls: bool,
}

#[async_trait]
pub trait ProxyReconciler: Send + Sync {
    /// Route `domain` to `host:port`, replacing any route for the same domain.
    async fn add_domain_with_auto_tls(
        &self,
        domain: &str,
        host: &str,
        port: u16,
        options: RouteOptions,
    ) -> Result<()>;
    /// Drop the route for `domain`. Missing routes are not an error.
    async fn delete_domain(&self, domain: &str) -> Result<()>;
    async fn reload(&self) -> Result<()>;
}

/// `@id` under which the route for `domain` is stored.
pub fn route_id(domain: &str) -> String {
    let sanitized: String = domain
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("{SERVER_NAME}_{sanitized}")
}

pub fn route_config(domain: &str, host: &str, port: u16, options: RouteOptions) -> Value {
    let mut handler = json!({
        "handler": "reverse_proxy",
        "upstreams": [{ "dial": format!("{host}:{port}") }],
    });
    if options.upstream_tls {
        handler["transport"] = json!({ "protocol": "http", "tls": {} });
    }
    json!({
        "@id": route_id(domain),
        "match": [{ "host": [domain] }],
        "handle": [handler],
        "terminal": true,
    })
}

pub struct CaddyProxy {
    client: reqwest::Client,
    admin_url: String,
}

impl CaddyProxy {
    pub fn new(admin_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            admin_url: admin_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.admin_url, path)
    }

    fn server_path() -> String {
        format!("/config/apps/http/servers/{SERVER_NAME}")
    }

    /// Create the HTTP server entry on first use.
    async fn ensure_server(&self) -> Result<()> {
        let resp = self
            .client
            .get(self.url(&Self::server_path()))
            .send()
            .await
            .context("Failed to reach the proxy admin API")?;
        if resp.status().is_success() {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            if !body.is_null() {
                return Ok(());
            }
        }
        info!("creating proxy server '{}'", SERVER_NAME);
        self.client
            .put(self.url(&Self::server_path()))
            .json(&json!({ "listen": [":80", ":443"], "routes": [] }))
            .send()
            .await
            .context("Failed to create proxy server")?
            .error_for_status()
            .context("Proxy admin API rejected server creation")?;
        Ok(())
    }

    async fn delete_route(&self, domain: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/id/{}", route_id(domain))))
            .send()
            .await
            .context("Failed to reach the proxy admin API")?;
        // Unknown ids come back as 404 (older admin APIs answer 500).
        if resp.status().is_success()
            || resp.status() == reqwest::StatusCode::NOT_FOUND
            || resp.status().is_server_error()
        {
            return Ok(());
        }
        resp.error_for_status()
            .with_context(|| format!("Proxy admin API rejected route removal for {}", domain))?;
        Ok(())
    }
}

#[async_trait]
impl ProxyReconciler for CaddyProxy {
    async fn add_domain_with_auto_tls(
        &self,
        domain: &str,
        host: &str,
        port: u16,
        options: RouteOptions,
    ) -> Result<()> {
        self.ensure_server().await?;
        self.delete_route(domain).await?;
        self.client
            .post(self.url(&format!("{}/routes", Self::server_path())))
            .json(&route_config(domain, host, port, options))
            .send()
            .await
            .context("Failed to reach the proxy admin API")?
            .error_for_status()
            .with_context(|| format!("Proxy admin API rejected route for {}", domain))?;
        debug!(domain, upstream = %format!("{host}:{port}"), "proxy route added");
        Ok(())
    }

    async fn delete_domain(&self, domain: &str) -> Result<()> {
        self.delete_route(domain).await?;
        debug!(domain, "proxy route removed");
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let config: Value = self
            .client
            .get(self.url("/config/"))
            .send()
            .await
            .context("Failed to reach the proxy admin API")?
            .error_for_status()
            .context("Proxy admin API refused config read")?
            .json()
            .await
            .context("Proxy admin API returned invalid config")?;
        self.client
            .post(self.url("/load"))
            .header("Cache-Control", "must-revalidate")
            .json(&config)
            .send()
            .await
            .context("Failed to reach the proxy admin API")?
            .error_for_status()
            .context("Proxy admin API rejected reload")?;
        Ok(())
    }
}
