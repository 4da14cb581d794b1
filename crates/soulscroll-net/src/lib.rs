//! # SoulScroll Net
//!
//! Request and response snapshots plus the [`Fetcher`] seam through which
//! the offline worker reaches the network. Responses carry a fully-read
//! body so they can be stored in a cache and cloned.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::Url;

pub mod loader;

pub use loader::{HttpFetcher, LoaderConfig};

#[derive(Error, Debug)]
pub enum NetError {
    /// No connection could be made.
    #[error("Offline")]
    Offline,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected status {status} for {url}")]
    BadStatus { url: Url, status: StatusCode },

    /// The body could not be decoded as requested.
    #[error("Malformed body: {0}")]
    Body(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    #[default]
    Subresource,
}

/// Whether cookies travel with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub mode: RequestMode,
    pub credentials: CredentialsMode,
}

impl Request {
    fn with_method(url: Url, method: Method) -> Self {
        Self {
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: Some(Duration::from_secs(30)),
            mode: RequestMode::Subresource,
            credentials: CredentialsMode::SameOrigin,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::with_method(url, Method::GET)
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Option<Bytes>) -> Self {
        let mut request = Self::with_method(url, Method::POST);
        request.body = body;
        request
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Bound the whole exchange, overriding the client default.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set credentials mode.
    pub fn credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    /// Whether this is a full-page navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// HTTP response with a fully-read body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Create an empty response.
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Turn a non-2xx response into [`NetError::BadStatus`].
    pub fn error_for_status(self) -> Result<Self, NetError> {
        if self.ok() {
            Ok(self)
        } else {
            Err(NetError::BadStatus {
                url: self.url,
                status: self.status,
            })
        }
    }

    /// Borrow the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::Body(e.to_string()))
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::Body(e.to_string()))
    }
}

/// The network as seen by the worker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform a request. Non-2xx statuses are returned, not raised.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}
