//! Reading raw documents from upstream sources.

use std::{future::Future, time::Duration};

use http_body_util::{BodyExt as _, Empty};
use hyper::{
    body::Bytes,
    header::{self, HeaderMap},
    http::uri::{InvalidUri, PathAndQuery},
    StatusCode, Uri,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

/// Maximum number of redirects followed by a single fetch.
pub const MAX_REDIRECTS: usize = 10;

/// Errors that can occur when fetching an upstream document.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    /// Source URL cannot be parsed.
    #[error("invalid source URL `{url}`: {source}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parsing error.
        #[source]
        source: InvalidUri,
    },
    /// Connecting to the source or sending the request failed.
    #[error("transport error: {0}")]
    Transport(#[source] hyper_util::client::legacy::Error),
    /// Source responded with a non-success status.
    #[error("upstream responded with status {0}")]
    Status(StatusCode),
    /// Source redirected to a location that cannot be resolved.
    #[error("invalid redirect location `{location}`")]
    InvalidRedirect {
        /// Raw `Location` header value.
        location: String,
    },
    /// Source redirected more than [`MAX_REDIRECTS`] times.
    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),
    /// Reading the response body failed.
    #[error("failed reading response body: {0}")]
    Body(#[source] hyper::Error),
    /// Fetch didn't complete in time.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Remote read of a source URL.
///
/// Implementations perform a single attempt without retries. Failures are returned
/// as [`FetchError`]s; it's up to the caller to decide on fallback behavior.
pub trait Fetch: Send + Sync {
    /// Fetches the document at `url` and returns its raw body.
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Bytes, FetchError>> + Send;
}

/// [`Fetch`] implementation based on the `hyper` HTTP/1 client.
///
/// Both `http` and `https` URLs are supported; TLS uses `rustls` with the Mozilla root
/// certificates. Up to [`MAX_REDIRECTS`] redirects are followed. Each fetch is bounded
/// by a timeout; this covers connecting, following redirects and reading the entire response body.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    timeout: Duration,
}

impl HttpFetcher {
    /// Creates a fetcher with the specified per-fetch `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            timeout,
        }
    }

    async fn fetch_uri(&self, mut uri: Uri) -> Result<Bytes, FetchError> {
        let mut redirects = 0;
        loop {
            let response = self
                .client
                .get(uri.clone())
                .await
                .map_err(FetchError::Transport)?;
            let status = response.status();
            if status.is_success() {
                let body = response
                    .into_body()
                    .collect()
                    .await
                    .map_err(FetchError::Body)?;
                return Ok(body.to_bytes());
            }

            let Some(location) = redirect_location(status, response.headers()) else {
                return Err(FetchError::Status(status));
            };
            if redirects == MAX_REDIRECTS {
                return Err(FetchError::TooManyRedirects(MAX_REDIRECTS));
            }
            redirects += 1;
            let target = resolve_location(&uri, location)?;
            tracing::debug!(%uri, %target, %status, "Following redirect");
            uri = target;
        }
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let uri: Uri = url.parse().map_err(|source| FetchError::InvalidUrl {
            url: url.to_owned(),
            source,
        })?;
        tokio::time::timeout(self.timeout, self.fetch_uri(uri))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
    }
}

fn redirect_location(status: StatusCode, headers: &HeaderMap) -> Option<&[u8]> {
    let is_redirect = matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    );
    if is_redirect {
        headers.get(header::LOCATION).map(|value| value.as_bytes())
    } else {
        None
    }
}

/// Resolves a `Location` header value against the URI of the redirecting request.
fn resolve_location(base: &Uri, location: &[u8]) -> Result<Uri, FetchError> {
    let invalid = || FetchError::InvalidRedirect {
        location: String::from_utf8_lossy(location).into_owned(),
    };
    let location = std::str::from_utf8(location).map_err(|_| invalid())?.trim();
    if location.is_empty() {
        return Err(invalid());
    }

    if let Some(rest) = location.strip_prefix("//") {
        let scheme = base.scheme_str().unwrap_or("http");
        return format!("{scheme}://{rest}").parse().map_err(|_| invalid());
    }
    let path_and_query = if location.starts_with('/') {
        location.to_owned()
    } else if let Ok(absolute) = location.parse::<Uri>() {
        if absolute.scheme().is_some() {
            return Ok(absolute);
        }
        relative_path(base, location)
    } else {
        relative_path(base, location)
    };

    let path_and_query: PathAndQuery = path_and_query.parse().map_err(|_| invalid())?;
    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).map_err(|_| invalid())
}

/// Replaces the last segment of the base path with `location`.
fn relative_path(base: &Uri, location: &str) -> String {
    let base_path = base.path();
    let dir = base_path.rfind('/').map_or("/", |pos| &base_path[..=pos]);
    format!("{dir}{location}")
}
