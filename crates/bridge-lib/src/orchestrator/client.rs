//! HTTP client for the cluster API with optional mutual TLS

use super::watch::{WatchDecoder, WatchStream};
use super::{Orchestrator, OrchestratorError};
use crate::models::{AnnotationPatch, Binding, Event, JobId, Pod, PodList, DEFAULT_NAMESPACE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use url::Url;

const PODS_PATH: &str = "/api/v1/pods";
const WATCH_PODS_PATH: &str = "/api/v1/watch/pods";
const UNSCHEDULED_SELECTOR: &str = "spec.nodeName=";
const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";
const ACCEPT_JSON: &str = "application/json, */*";

/// Configuration for the cluster API client
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// API server base URL (e.g., "https://10.0.0.1:443")
    pub api_server: Url,
    /// Path to CA bundle for server verification
    pub ca_cert_path: Option<PathBuf>,
    /// Path to client certificate for mTLS
    pub client_cert_path: Option<PathBuf>,
    /// Path to client private key
    pub client_key_path: Option<PathBuf>,
    /// Namespace used for pods that carry none
    pub namespace: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Timeout for non-streaming requests
    pub request_timeout: Duration,
    /// Channel buffer between the watch reader and its consumer
    pub watch_buffer: usize,
}

impl OrchestratorConfig {
    pub fn new(api_server: Url) -> Self {
        Self {
            api_server,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            watch_buffer: 16,
        }
    }
}

/// Cluster API client over HTTP(S)
pub struct HttpOrchestrator {
    client: Client,
    config: OrchestratorConfig,
}

impl HttpOrchestrator {
    /// Build the client, loading TLS material when the API server is HTTPS
    pub async fn new(config: OrchestratorConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(100);

        match config.api_server.scheme() {
            "http" => {}
            "https" => {
                builder = builder.use_rustls_tls();

                if let Some(ca_path) = &config.ca_cert_path {
                    let ca = tokio::fs::read(ca_path)
                        .await
                        .with_context(|| format!("Failed to read CA certificate from {:?}", ca_path))?;
                    let ca = reqwest::Certificate::from_pem(&ca)
                        .with_context(|| format!("Invalid CA certificate in {:?}", ca_path))?;
                    builder = builder.add_root_certificate(ca);
                }

                match (&config.client_cert_path, &config.client_key_path) {
                    (Some(cert_path), Some(key_path)) => {
                        let mut pem = tokio::fs::read(cert_path).await.with_context(|| {
                            format!("Failed to read client certificate from {:?}", cert_path)
                        })?;
                        let key = tokio::fs::read(key_path).await.with_context(|| {
                            format!("Failed to read client key from {:?}", key_path)
                        })?;
                        pem.push(b'\n');
                        pem.extend_from_slice(&key);
                        let identity = reqwest::Identity::from_pem(&pem)
                            .context("Invalid client certificate or key")?;
                        builder = builder.identity(identity);
                    }
                    (None, None) => {
                        warn!("No client certificate configured, connecting without mTLS");
                    }
                    _ => anyhow::bail!("Client certificate and key must be given together"),
                }
            }
            other => anyhow::bail!("Unsupported API server scheme: {}", other),
        }

        let client = builder.build().context("Failed to create HTTP client")?;

        info!(api_server = %config.api_server, "Cluster API client configured");
        Ok(Self { client, config })
    }

    pub fn api_server(&self) -> &Url {
        &self.config.api_server
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.config.api_server.clone();
        url.set_path(path);
        url.set_query(None);
        url
    }

    fn unscheduled_endpoint(&self, path: &str, sorted: bool) -> Url {
        let mut url = self.endpoint(path);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("fieldSelector", UNSCHEDULED_SELECTOR);
            if sorted {
                query.append_pair("sort", "creationTimestamp asc");
            }
        }
        url
    }

    fn namespace<'a>(&'a self, pod: &'a Pod) -> &'a str {
        pod.namespace_or(&self.config.namespace)
    }

    fn pod_path(&self, pod: &Pod) -> String {
        format!("/api/v1/namespaces/{}/pods/{}", self.namespace(pod), pod.name())
    }

    fn transport(url: &Url, source: reqwest::Error) -> OrchestratorError {
        OrchestratorError::Transport {
            endpoint: url.to_string(),
            source,
        }
    }
}

/// Reject any status other than `expected`, capturing the body for the error
async fn expect_status(
    response: Response,
    expected: StatusCode,
    operation: &'static str,
) -> Result<Response, OrchestratorError> {
    if response.status() == expected {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(OrchestratorError::Status {
        operation,
        status,
        body,
    })
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn list_unscheduled_pods(&self) -> Result<Vec<Pod>, OrchestratorError> {
        let url = self.unscheduled_endpoint(PODS_PATH, false);

        let response = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, ACCEPT_JSON)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| Self::transport(&url, e))?;
        let response = expect_status(response, StatusCode::OK, "List pods").await?;

        let list: PodList = response
            .json()
            .await
            .map_err(|e| OrchestratorError::decode("pod list", e))?;

        Ok(list
            .items
            .into_iter()
            .filter(|pod| !pod.is_scheduled())
            .collect())
    }

    async fn watch_unscheduled_pods(&self) -> Result<WatchStream, OrchestratorError> {
        let url = self.unscheduled_endpoint(WATCH_PODS_PATH, true);

        let response = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, ACCEPT_JSON)
            .send()
            .await
            .map_err(|e| Self::transport(&url, e))?;
        let response = expect_status(response, StatusCode::OK, "Watch pods").await?;

        let (tx, rx) = mpsc::channel(self.config.watch_buffer.max(1));

        tokio::spawn(async move {
            let mut decoder = WatchDecoder::new();
            let mut body = Box::pin(response.bytes_stream());

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(Self::transport(&url, e))).await;
                        return;
                    }
                };

                for result in decoder.push(&chunk) {
                    let failed = result.is_err();
                    if tx.send(result).await.is_err() {
                        debug!("Watch consumer dropped, closing connection");
                        return;
                    }
                    if failed {
                        return;
                    }
                }
            }

            if let Some(result) = decoder.finish() {
                let _ = tx.send(result).await;
            }
            debug!("Watch connection closed by server");
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn annotate_job_id(&self, pod: &Pod, job_id: &JobId) -> Result<(), OrchestratorError> {
        let url = self.endpoint(&self.pod_path(pod));
        let body = serde_json::to_vec(&AnnotationPatch::job_id(job_id))
            .map_err(|e| OrchestratorError::decode("annotation patch", e))?;

        let response = self
            .client
            .patch(url.clone())
            .header(header::CONTENT_TYPE, STRATEGIC_MERGE_PATCH)
            .header(header::ACCEPT, ACCEPT_JSON)
            .timeout(self.config.request_timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| Self::transport(&url, e))?;
        expect_status(response, StatusCode::OK, "Annotate pod").await?;

        debug!(pod = %pod.name(), job_id = %job_id, "Recorded job id annotation");
        Ok(())
    }

    async fn bind(&self, pod: &Pod, binding: &Binding) -> Result<(), OrchestratorError> {
        let url = self.endpoint(&format!("{}/binding/", self.pod_path(pod)));

        let response = self
            .client
            .post(url.clone())
            .timeout(self.config.request_timeout)
            .json(binding)
            .send()
            .await
            .map_err(|e| Self::transport(&url, e))?;
        expect_status(response, StatusCode::CREATED, "Binding").await?;
        Ok(())
    }

    async fn post_event(&self, event: &Event) -> Result<(), OrchestratorError> {
        let url = self.endpoint(&format!(
            "/api/v1/namespaces/{}/events",
            event.involved_object.namespace
        ));

        let response = self
            .client
            .post(url.clone())
            .timeout(self.config.request_timeout)
            .json(event)
            .send()
            .await
            .map_err(|e| Self::transport(&url, e))?;
        expect_status(response, StatusCode::CREATED, "Event").await?;
        Ok(())
    }
}
