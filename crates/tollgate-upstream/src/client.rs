use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use secrecy::ExposeSecret;
use tollgate_store::UpstreamEndpoint;

use crate::DispatchError;

/// Shared HTTP client for every upstream exchange
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: Client,
}

impl UpstreamClient {
    /// Build the client
    ///
    /// Only the connect timeout is fixed here; each exchange sets its own
    /// overall deadline.
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { http })
    }

    /// Authenticated `POST` to `path` under the endpoint's base URL
    pub fn post(&self, upstream: &UpstreamEndpoint, path: &str) -> RequestBuilder {
        self.http
            .post(endpoint_url(&upstream.base_url, path))
            .bearer_auth(upstream.api_key.expose_secret())
    }

    /// Send and require a success status
    ///
    /// A non-success answer becomes [`DispatchError::UpstreamStatus`] carrying
    /// the body text.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, DispatchError> {
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::UpstreamStatus { status, body });
        }

        Ok(response)
    }
}

fn endpoint_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
