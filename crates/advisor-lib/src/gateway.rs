//! HTTP client for the telemetry gateway
//!
//! One JSON gateway fronts the three upstream capabilities the collector
//! needs, so a single client implements [`RoleAssumer`], [`ClusterDirectory`]
//! and [`MetricsApi`]:
//!
//! - `POST v1/sts/assume-role`
//! - `GET  v1/regions/{region}/clusters`
//! - `GET  v1/regions/{region}/instances`
//! - `GET  v1/regions/{region}/metrics`
//!
//! Status mapping: 429 is throttling (honoring `Retry-After` seconds),
//! 401/403 is a permission failure, 404 is not-found, 5xx and transport
//! errors are transient, and undecodable bodies are malformed.

use crate::collector::{
    ClusterDescription, ClusterDirectory, DirectoryError, InstanceDescription, MetricPage,
    MetricQuery, MetricsApi, MetricsApiError, Page,
};
use crate::credentials::{AssumeRoleError, RoleAssumer, RoleRef, ScopedCredential};
use crate::retry::MAX_RETRY_HINT;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

const ACCESS_KEY_HEADER: &str = "x-fleet-access-key-id";

/// Upstream failure before it is mapped onto a capability's error type
#[derive(Debug)]
enum GatewayFailure {
    Throttled(Option<Duration>),
    Denied(String),
    NotFound(String),
    Transient(String),
    Malformed(String),
}

impl From<GatewayFailure> for AssumeRoleError {
    fn from(failure: GatewayFailure) -> Self {
        match failure {
            GatewayFailure::Denied(reason) | GatewayFailure::NotFound(reason) => {
                AssumeRoleError::Denied(reason)
            }
            GatewayFailure::Throttled(_) => AssumeRoleError::Unavailable("throttled".to_string()),
            GatewayFailure::Transient(reason) | GatewayFailure::Malformed(reason) => {
                AssumeRoleError::Unavailable(reason)
            }
        }
    }
}

impl From<GatewayFailure> for DirectoryError {
    fn from(failure: GatewayFailure) -> Self {
        match failure {
            GatewayFailure::Throttled(retry_after) => DirectoryError::Throttled { retry_after },
            GatewayFailure::Denied(reason) => DirectoryError::AccessDenied(reason),
            GatewayFailure::NotFound(reason) => DirectoryError::NotFound(reason),
            GatewayFailure::Transient(reason) => DirectoryError::Unavailable(reason),
            GatewayFailure::Malformed(reason) => DirectoryError::Malformed(reason),
        }
    }
}

impl From<GatewayFailure> for MetricsApiError {
    fn from(failure: GatewayFailure) -> Self {
        match failure {
            GatewayFailure::Throttled(retry_after) => MetricsApiError::Throttled { retry_after },
            GatewayFailure::Denied(reason) => MetricsApiError::PermissionDenied(reason),
            GatewayFailure::NotFound(reason) | GatewayFailure::Malformed(reason) => {
                MetricsApiError::Malformed(reason)
            }
            GatewayFailure::Transient(reason) => MetricsApiError::Transient(reason),
        }
    }
}

#[derive(Debug, Serialize)]
struct AssumeRoleRequest<'a> {
    role_arn: String,
    session_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caller_role_arn: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleResponse {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expiration: DateTime<Utc>,
}

/// Client for the telemetry gateway
#[derive(Clone)]
pub struct GatewayClient {
    client: Client,
    base_url: Url,
}

impl GatewayClient {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        // Url::join drops the last segment unless the base ends in '/'
        let endpoint = if endpoint.ends_with('/') {
            endpoint.to_string()
        } else {
            format!("{}/", endpoint)
        };
        let base_url = Url::parse(&endpoint).context("Invalid gateway URL")?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, GatewayFailure> {
        self.base_url
            .join(path)
            .map_err(|e| GatewayFailure::Malformed(format!("invalid request path {}: {}", path, e)))
    }

    fn authorize(request: RequestBuilder, cred: &ScopedCredential) -> RequestBuilder {
        request
            .header(AUTHORIZATION, format!("Bearer {}", cred.session_token()))
            .header(ACCESS_KEY_HEADER, cred.access_key_id())
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayFailure> {
        let response = request.send().await.map_err(|e| {
            if e.is_decode() {
                GatewayFailure::Malformed(e.to_string())
            } else {
                GatewayFailure::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, "Gateway returned an error");
            return Err(classify_status(status, retry_after, body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayFailure::Transient(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| GatewayFailure::Malformed(e.to_string()))
    }
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> GatewayFailure {
    let reason = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    match status {
        StatusCode::TOO_MANY_REQUESTS => GatewayFailure::Throttled(retry_after),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayFailure::Denied(reason),
        StatusCode::NOT_FOUND => GatewayFailure::NotFound(reason),
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            GatewayFailure::Transient(reason)
        }
        _ => GatewayFailure::Malformed(reason),
    }
}

/// `Retry-After` in whole seconds, capped at [`MAX_RETRY_HINT`]; HTTP dates
/// are ignored
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_HINT))
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl RoleAssumer for GatewayClient {
    async fn assume_role(
        &self,
        caller: Option<&ScopedCredential>,
        role: &RoleRef,
        session_name: &str,
    ) -> Result<ScopedCredential, AssumeRoleError> {
        let url = self.url("v1/sts/assume-role")?;
        let body = AssumeRoleRequest {
            role_arn: role.arn(),
            session_name,
            caller_role_arn: caller.map(|c| c.role_arn()),
        };

        let mut request = self.client.post(url).json(&body);
        if let Some(cred) = caller {
            request = Self::authorize(request, cred);
        }

        let response: AssumeRoleResponse = self.send_json(request).await?;
        Ok(ScopedCredential::new(
            role,
            response.access_key_id,
            response.secret_access_key,
            response.session_token,
            response.expiration,
        ))
    }
}

#[async_trait]
impl ClusterDirectory for GatewayClient {
    async fn describe_clusters(
        &self,
        cred: &ScopedCredential,
        region: &str,
        cluster_filter: Option<&str>,
        marker: Option<&str>,
    ) -> Result<Page<ClusterDescription>, DirectoryError> {
        let url = self.url(&format!("v1/regions/{}/clusters", region))?;
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(cluster) = cluster_filter {
            query.push(("cluster_identifier", cluster));
        }
        if let Some(marker) = marker {
            query.push(("marker", marker));
        }

        let request = Self::authorize(self.client.get(url).query(&query), cred);
        Ok(self.send_json(request).await?)
    }

    async fn describe_instances(
        &self,
        cred: &ScopedCredential,
        region: &str,
        instance_filter: Option<&str>,
        marker: Option<&str>,
    ) -> Result<Page<InstanceDescription>, DirectoryError> {
        let url = self.url(&format!("v1/regions/{}/instances", region))?;
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(instance) = instance_filter {
            query.push(("instance_identifier", instance));
        }
        if let Some(marker) = marker {
            query.push(("marker", marker));
        }

        let request = Self::authorize(self.client.get(url).query(&query), cred);
        Ok(self.send_json(request).await?)
    }
}

#[async_trait]
impl MetricsApi for GatewayClient {
    async fn get_metric_page(
        &self,
        cred: &ScopedCredential,
        query: &MetricQuery,
    ) -> Result<MetricPage, MetricsApiError> {
        let url = self.url(&format!("v1/regions/{}/metrics", query.region))?;
        let start = rfc3339(query.start);
        let end = rfc3339(query.end);
        let period = query.period_secs.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("instance_id", query.instance_id.as_str()),
            ("metric_name", query.metric_name.as_str()),
            ("start", start.as_str()),
            ("end", end.as_str()),
            ("period", period.as_str()),
        ];
        if let Some(token) = &query.next_token {
            params.push(("next_token", token.as_str()));
        }

        let request = Self::authorize(self.client.get(url).query(&params), cred);
        Ok(self.send_json(request).await?)
    }
}
