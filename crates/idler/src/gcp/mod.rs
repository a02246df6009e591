//! Thin REST plumbing shared by every Google API the service talks to.

pub mod compute;
pub mod token;

use reqwest::{Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::{config::GcpConfig, Error, Result};

pub use compute::GceClient;
pub use token::{TokenProvider, TokenSource};

/// Google error envelope: `{"error": {"code": 409, "message": "...", "status": "ALREADY_EXISTS"}}`.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Authenticated JSON client for the Google REST APIs.
///
/// Built once per process and shared; `reqwest::Client` pools connections and
/// is safe to use from concurrent requests.
pub struct GcpHttp {
    client: Client,
    tokens: TokenSource,
}

impl GcpHttp {
    pub fn new(config: &GcpConfig) -> Result<Self> {
        // Operation waits block server-side for up to two minutes
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(150))
            .build()?;

        let provider = match &config.access_token {
            Some(token) => TokenProvider::Static(token.clone()),
            None => TokenProvider::MetadataServer {
                host: config.metadata_host.clone(),
            },
        };

        Ok(Self {
            tokens: TokenSource::new(provider, client.clone()),
            client,
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let request = self.client.request(Method::GET, url).query(query);
        self.send(Method::GET, url, request).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> Result<T> {
        let request = self.client.request(Method::POST, url).query(query).json(body);
        self.send(Method::POST, url, request).await
    }

    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        let request = self.client.request(Method::PUT, url).json(body);
        self.send(Method::PUT, url, request).await
    }

    pub async fn patch<B: Serialize + ?Sized, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        let request = self.client.request(Method::PATCH, url).json(body);
        self.send(Method::PATCH, url, request).await
    }

    async fn send<T: DeserializeOwned>(&self, method: Method, url: &str, request: RequestBuilder) -> Result<T> {
        let token = self.tokens.token().await?;
        debug!("{} {}", method, url);

        let response = request.bearer_auth(token).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(provider_error(status.as_u16(), &body));
        }

        let bytes = response.bytes().await?;
        // Some endpoints answer with an empty body on success
        if bytes.is_empty() {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn provider_error(status: u16, body: &str) -> Error {
    let message = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => match envelope.error.status {
            Some(code) => format!("{}: {}", code, envelope.error.message),
            None => envelope.error.message,
        },
        Err(_) => body.trim().to_string(),
    };
    Error::Provider { status, message }
}

/// Last path segment of a resource URL such as a zone or network self link.
pub fn short_name(self_link: &str) -> &str {
    self_link.rsplit('/').next().unwrap_or(self_link)
}
