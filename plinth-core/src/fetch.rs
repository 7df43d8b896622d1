//! Inter-plugin HTTP client.
//!
//! Calls between plugins go over the in-cluster origin and carry a
//! short-lived service token identifying the calling plugin. Callers
//! provide the timeout; there is no ambient default beyond the transport's
//! connect timeout.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::ServiceTokenIssuer;
use crate::error::AppError;

/// HTTP client scoped to one calling plugin.
#[derive(Clone)]
pub struct FetchClient {
    client: reqwest::Client,
    issuer: Arc<dyn ServiceTokenIssuer>,
    internal_url: String,
    plugin_id: String,
}

impl FetchClient {
    pub fn new(issuer: Arc<dyn ServiceTokenIssuer>, internal_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            issuer,
            internal_url: internal_url.into(),
            plugin_id: String::new(),
        }
    }

    /// A view minting tokens on behalf of `plugin_id`.
    pub fn for_plugin(&self, plugin_id: &str) -> Self {
        let mut scoped = self.clone();
        scoped.plugin_id = plugin_id.to_string();
        scoped
    }

    /// Call another plugin's API: `/api/<target>/<path>` on the in-cluster
    /// origin, authenticated as this plugin.
    pub async fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        target_plugin: &str,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<R, AppError> {
        let token = self.issuer.issue(&self.plugin_id)?;
        let url = format!(
            "{}/api/{}/{}",
            self.internal_url.trim_end_matches('/'),
            target_plugin,
            path.trim_start_matches('/')
        );

        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(token)
            .timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("inter-plugin fetch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Internal(format!(
                "inter-plugin fetch returned {status}: {text}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("inter-plugin response decode failed: {e}")))
    }
}
