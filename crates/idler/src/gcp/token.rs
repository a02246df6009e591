//! OAuth access tokens for the Google APIs.
//!
//! Tokens come from `GCP_ACCESS_TOKEN` when set, otherwise from the metadata
//! server of the machine (or serverless runtime) we are running on. Metadata
//! tokens are fetched on first use and cached until shortly before expiry.

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{Error, Result};

/// Refresh this long before the provider-reported expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub enum TokenProvider {
    Static(String),
    MetadataServer { host: String },
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: i64,
}

pub struct TokenSource {
    provider: TokenProvider,
    client: Client,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(provider: TokenProvider, client: Client) -> Self {
        Self {
            provider,
            client,
            cached: RwLock::new(None),
        }
    }

    pub async fn token(&self) -> Result<String> {
        let host = match &self.provider {
            TokenProvider::Static(token) => return Ok(token.clone()),
            TokenProvider::MetadataServer { host } => host,
        };

        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
                return Ok(token.value.clone());
            }
        }

        let mut cached = self.cached.write().await;
        // Another request may have refreshed while we waited for the lock
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.value.clone());
        }

        let fresh = self.fetch_from_metadata(host).await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn fetch_from_metadata(&self, host: &str) -> Result<CachedToken> {
        let url = format!(
            "http://{}/computeMetadata/v1/instance/service-accounts/default/token",
            host
        );
        debug!("Fetching access token from {}", url);

        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider {
                status: status.as_u16(),
                message: format!("metadata token request failed: {}", body),
            });
        }

        let token: MetadataToken = response.json().await?;
        Ok(CachedToken {
            value: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}
