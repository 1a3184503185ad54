//! Instance store backed by the cluster REST API.
//!
//! Issues `GET {api_url}/apis/kubevirt.io/v1/namespaces/{ns}/virtualmachineinstances/{name}`
//! with the service account bearer token read from `token_file`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{InstanceStore, StoreError};
use crate::config::ClusterConfig;
use crate::model::VirtualMachineInstance;

/// REST client for instance records.
pub struct ApiStore {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiStore {
    pub fn new(http: reqwest::Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_config(api_url: &str, config: &ClusterConfig) -> Result<Self, StoreError> {
        let token = match config.token_file {
            Some(ref path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| {
                        StoreError::Unavailable(format!("failed to read token file {path}: {e}"))
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::new(http, api_url, token))
    }

    fn instance_url(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/apis/kubevirt.io/v1/namespaces/{namespace}/virtualmachineinstances/{name}",
            self.base_url
        )
    }
}

#[async_trait]
impl InstanceStore for ApiStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualMachineInstance, StoreError> {
        let mut request = self.http.get(self.instance_url(namespace, name));
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(StoreError::Unauthorized(resp.status().as_u16()))
            }
            status if status.is_success() => resp
                .json::<VirtualMachineInstance>()
                .await
                .map_err(|e| StoreError::Decode(e.to_string())),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(StoreError::Unavailable(format!("HTTP {status}: {body}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{extract::Path, http::HeaderMap, routing::get, Json, Router};
    use serde_json::{json, Value};

    async fn spawn_api() -> String {
        async fn vmi(
            Path((namespace, name)): Path<(String, String)>,
            headers: HeaderMap,
        ) -> Result<Json<Value>, axum::http::StatusCode> {
            if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer t0k") {
                return Err(axum::http::StatusCode::FORBIDDEN);
            }
            if name == "missing" {
                return Err(axum::http::StatusCode::NOT_FOUND);
            }
            Ok(Json(json!({
                "metadata": {"name": name, "namespace": namespace},
                "status": {"nodeName": "node01", "phase": "Running"},
            })))
        }

        let app = Router::new().route(
            "/apis/kubevirt.io/v1/namespaces/{namespace}/virtualmachineinstances/{name}",
            get(vmi),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_get_found_and_missing() {
        let base = spawn_api().await;
        let store = ApiStore::new(reqwest::Client::new(), &base, Some("t0k".into()));

        let vmi = store.get("default", "fedora").await.unwrap();
        assert_eq!(vmi.metadata.namespace, "default");
        assert_eq!(vmi.status.node_name.as_deref(), Some("node01"));

        assert!(matches!(
            store.get("default", "missing").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_bad_token_is_unauthorized() {
        let base = spawn_api().await;
        let store = ApiStore::new(reqwest::Client::new(), &base, Some("wrong".into()));
        assert!(matches!(
            store.get("default", "fedora").await,
            Err(StoreError::Unauthorized(403))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_is_unavailable() {
        let store = ApiStore::new(reqwest::Client::new(), "http://127.0.0.1:1", None);
        assert!(matches!(
            store.get("default", "fedora").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
