//! `reqwest`-backed [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::{Origin, Url};

use crate::{CredentialsMode, Fetcher, NetError, Request, Response};

/// Network client configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Keep a cookie jar for credentialed requests.
    pub cookies_enabled: bool,
    /// Origin of the page issuing requests. `SameOrigin` requests to any
    /// other origin go out without cookies; unset, every `SameOrigin`
    /// request is treated as same-origin.
    pub origin: Option<Url>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("SoulScroll-Offline/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
            origin: None,
        }
    }
}

impl LoaderConfig {
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Fetches over HTTP with `reqwest`.
///
/// Requests with [`CredentialsMode::Omit`], and cross-origin requests with
/// [`CredentialsMode::SameOrigin`], go through a second client that has no
/// cookie jar.
pub struct HttpFetcher {
    credentialed: Client,
    anonymous: Client,
    origin: Option<Origin>,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let build = |cookies: bool| {
            Client::builder()
                .user_agent(&config.user_agent)
                .timeout(config.default_timeout)
                .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
                .cookie_store(cookies)
                .build()
        };

        let credentialed = build(config.cookies_enabled)?;
        let anonymous = build(false)?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self {
            credentialed,
            anonymous,
            origin: config.origin.as_ref().map(Url::origin),
        })
    }

    fn client_for(&self, request: &Request) -> &Client {
        match request.credentials {
            CredentialsMode::Omit => &self.anonymous,
            CredentialsMode::Include => &self.credentialed,
            CredentialsMode::SameOrigin => match self.origin {
                Some(ref origin) if request.url.origin() != *origin => &self.anonymous,
                _ => &self.credentialed,
            },
        }
    }
}

fn map_reqwest_error(err: reqwest::Error, timeout: Option<Duration>) -> NetError {
    if err.is_timeout() {
        NetError::Timeout(timeout.unwrap_or_default())
    } else if err.is_connect() {
        NetError::Offline
    } else {
        NetError::Transport(err)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client_for(&request)
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        let mut snapshot = Response::new(url, status).with_body(body);
        snapshot.headers = headers;
        Ok(snapshot)
    }
}
