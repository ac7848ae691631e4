//! Sync Transport
//!
//! Push and pull calls to a mirror. The orchestrator only sees the
//! [`Transport`] trait; [`HttpTransport`] is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::timeout;

use super::payload::{ReceiveResponse, SignedPayload};
use super::{INSTANCE_HEADER, SIGNATURE_HEADER};
use crate::error::{Error, Result};
use crate::model::MirrorInstance;
use crate::store::format_ts;

/// Outbound calls to a mirror
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a signed change set to the mirror's receive endpoint
    async fn push(&self, mirror: &MirrorInstance, payload: &SignedPayload) -> Result<ReceiveResponse>;

    /// Fetch the mirror's changes after `since`. The returned payload is
    /// not verified yet.
    async fn pull(
        &self,
        mirror: &MirrorInstance,
        since: DateTime<Utc>,
        requester: &str,
    ) -> Result<SignedPayload>;
}

/// HTTP transport over reqwest
pub struct HttpTransport {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            request_timeout,
        })
    }

    fn endpoint(mirror: &MirrorInstance, path: &str) -> String {
        format!("{}{}", mirror.instance_url.trim_end_matches('/'), path)
    }

    async fn bounded<T>(
        &self,
        url: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(url.to_string())),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn push(&self, mirror: &MirrorInstance, payload: &SignedPayload) -> Result<ReceiveResponse> {
        let url = Self::endpoint(mirror, "/replication/receive");
        self.bounded(&url, async {
            let response = self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, &payload.signature)
                .header(INSTANCE_HEADER, &payload.instance)
                .body(payload.body.clone())
                .send()
                .await?
                .error_for_status()?;
            Ok(response.json::<ReceiveResponse>().await?)
        })
        .await
    }

    async fn pull(
        &self,
        mirror: &MirrorInstance,
        since: DateTime<Utc>,
        requester: &str,
    ) -> Result<SignedPayload> {
        let url = Self::endpoint(mirror, "/replication/changes");
        self.bounded(&url, async {
            let response = self
                .client
                .get(&url)
                .query(&[("since", format_ts(&since))])
                .header(INSTANCE_HEADER, requester)
                .send()
                .await?
                .error_for_status()?;

            let signature = response
                .headers()
                .get(SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| Error::SignatureRejected(format!("{} (unsigned response)", mirror.instance_id)))?;
            let body = response.bytes().await?.to_vec();

            Ok(SignedPayload {
                body,
                signature,
                instance: mirror.instance_id.clone(),
            })
        })
        .await
    }
}
