//! Azure Blob Storage backend for the blob lease manager.
//!
//! Uses the raw REST surface rather than an SDK: the manager only needs
//! three calls (create container, create blob, acquire lease), all of which
//! map onto single conditional PUTs. Authentication is a shared-access
//! signature appended to every request; processes sharing capacity must
//! point at the same account and container.

use super::{BlobStore, LeaseOutcome, StoreOutcome};
use crate::error::LeaseError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

const API_VERSION: &str = "2021-08-06";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Blob store client speaking the Azure Blob REST protocol.
pub struct AzureBlobStore {
    http: reqwest::Client,
    endpoint: String,
    container: String,
    sas_token: Option<String>,
}

impl AzureBlobStore {
    /// Creates a client for `container` in the given storage account.
    pub fn new(account: &str, container: &str) -> Result<Self, LeaseError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(LeaseError::from)?;
        Ok(Self {
            http,
            endpoint: format!("https://{account}.blob.core.windows.net"),
            container: container.to_string(),
            sas_token: None,
        })
    }

    /// Shared-access-signature credential appended to every request. The
    /// signature needs create and lease permissions on the container.
    pub fn with_sas_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.sas_token = Some(token.trim_start_matches('?').to_string());
        self
    }

    /// Overrides the service endpoint, for emulators and private
    /// deployments.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn container_url(&self) -> String {
        self.url(&format!("{}?restype=container", self.container))
    }

    fn blob_url(&self, name: &str) -> String {
        self.url(&format!("{}/{}", self.container, name))
    }

    fn lease_url(&self, name: &str) -> String {
        self.url(&format!("{}/{}?comp=lease", self.container, name))
    }

    fn url(&self, path_and_query: &str) -> String {
        let mut url = format!("{}/{}", self.endpoint, path_and_query);
        if let Some(sas) = &self.sas_token {
            url.push(if path_and_query.contains('?') { '&' } else { '?' });
            url.push_str(sas);
        }
        url
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn create_container(&self) -> Result<StoreOutcome, LeaseError> {
        let response = self
            .http
            .put(self.container_url())
            .header("x-ms-version", API_VERSION)
            .header("content-length", "0")
            .send()
            .await?;
        let status = response.status().as_u16();
        trace!(container = %self.container, status, "create container");
        match status {
            201 => Ok(StoreOutcome::Created),
            409 => Ok(StoreOutcome::AlreadyExists),
            _ => Err(LeaseError::Store {
                operation: "create container",
                status,
            }),
        }
    }

    async fn create_blob(&self, name: &str) -> Result<StoreOutcome, LeaseError> {
        let response = self
            .http
            .put(self.blob_url(name))
            .header("x-ms-version", API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("content-length", "0")
            // Only create the blob when it does not exist yet; peers race
            // through this same call during provisioning.
            .header("if-none-match", "*")
            .send()
            .await?;
        let status = response.status().as_u16();
        trace!(blob = name, status, "create blob");
        match status {
            201 => Ok(StoreOutcome::Created),
            409 | 412 => Ok(StoreOutcome::AlreadyExists),
            _ => Err(LeaseError::Store {
                operation: "create blob",
                status,
            }),
        }
    }

    async fn acquire_lease(
        &self,
        name: &str,
        lease_id: Uuid,
        ttl: Duration,
    ) -> Result<LeaseOutcome, LeaseError> {
        let response = self
            .http
            .put(self.lease_url(name))
            .header("x-ms-version", API_VERSION)
            .header("x-ms-lease-action", "acquire")
            .header("x-ms-lease-duration", ttl.as_secs().to_string())
            .header("x-ms-proposed-lease-id", lease_id.to_string())
            .header("content-length", "0")
            .send()
            .await?;
        let status = response.status().as_u16();
        trace!(blob = name, status, "acquire lease");
        match status {
            201 => Ok(LeaseOutcome::Acquired),
            409 => Ok(LeaseOutcome::Conflict),
            _ => Err(LeaseError::Store {
                operation: "acquire lease",
                status,
            }),
        }
    }
}
