//! `MetricsExporter` and closely related types.

use std::{
    convert::Infallible,
    fmt,
    future::{self, Future},
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
};

use hyper::{
    body::Incoming,
    header::{self, HeaderValue},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::{io, net::TcpListener, sync::watch};

use crate::{
    config::Config,
    fetcher::{Fetch, HttpFetcher},
    renderer::Renderer,
};


/// Path serving the metrics.
pub const METRICS_PATH: &str = "/metrics";
/// Content type of the Prometheus text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn handle_request<F: Fetch>(
    renderer: &Renderer<F>,
    request: &Request<Incoming>,
) -> Response<String> {
    if request.uri().path() != METRICS_PATH {
        return plain_response(StatusCode::NOT_FOUND, "Not Found\n".to_owned());
    }
    if request.method() != Method::GET {
        let mut response =
            plain_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n".to_owned());
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET"));
        return response;
    }

    let mut response = Response::new(renderer.render().await);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(TEXT_CONTENT_TYPE),
    );
    response
}

fn plain_response(status: StatusCode, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Metrics exporter to Prometheus.
///
/// The exporter serves metrics rendered by a [`Renderer`] on [`METRICS_PATH`]. Upstream sources
/// are only fetched during scrapes; there is no background polling.
pub struct MetricsExporter<'a, F = HttpFetcher> {
    renderer: Arc<Renderer<F>>,
    shutdown_future: Pin<Box<dyn Future<Output = ()> + Send + 'a>>,
}

impl<F> fmt::Debug for MetricsExporter<'_, F> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MetricsExporter")
            .field("renderer", &self.renderer)
            .finish_non_exhaustive()
    }
}

impl MetricsExporter<'_> {
    /// Creates an exporter fetching upstream sources over HTTP as specified in `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(Renderer::from_config(config))
    }
}

impl<'a, F: Fetch + 'static> MetricsExporter<'a, F> {
    /// Creates an exporter based on the provided renderer.
    pub fn new(renderer: Renderer<F>) -> Self {
        tracing::info!(
            "Created metrics exporter with {} state metrics",
            renderer.state_count()
        );
        Self {
            renderer: Arc::new(renderer),
            shutdown_future: Box::pin(future::pending()),
        }
    }

    /// Returns the renderer used by this exporter.
    pub fn renderer(&self) -> &Arc<Renderer<F>> {
        &self.renderer
    }

    /// Configures graceful shutdown for the exporter server.
    #[must_use]
    pub fn with_graceful_shutdown<Fut>(mut self, shutdown: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'a,
    {
        self.shutdown_future = Box::pin(shutdown);
        self
    }

    /// Starts the server on the specified address. This future resolves when the server is shut down.
    ///
    /// The server will expose the following endpoints:
    ///
    /// - `GET` on [`METRICS_PATH`]: serves the metrics in the Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the specified address fails.
    pub async fn start(self, bind_address: SocketAddr) -> io::Result<()> {
        let server = self.bind(bind_address).await?;
        tracing::info!(
            "Listening for prometheus on {}{METRICS_PATH}",
            server.local_addr()
        );
        server.start().await?;
        tracing::info!("Prometheus metrics exporter server shut down");
        Ok(())
    }

    /// Creates an HTTP exporter server and binds it to the specified address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the specified address fails.
    pub async fn bind(mut self, bind_address: SocketAddr) -> io::Result<MetricsServer<'a>> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        let server = async move {
            let (started_shutdown_sender, started_shutdown) = watch::channel(());
            loop {
                let (stream, peer_addr) = tokio::select! {
                    res = listener.accept() => res?,
                    () = &mut self.shutdown_future => break,
                };

                let io = TokioIo::new(stream);
                let renderer = Arc::clone(&self.renderer);
                let mut started_shutdown = started_shutdown.clone();
                tokio::spawn(async move {
                    let service = service_fn(|request: Request<Incoming>| {
                        let renderer = Arc::clone(&renderer);
                        async move {
                            Ok::<_, Infallible>(handle_request(&renderer, &request).await)
                        }
                    });
                    let conn = http1::Builder::new().serve_connection(io, service);
                    tokio::pin!(conn);

                    let res = tokio::select! {
                        _ = started_shutdown.changed() => {
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                        res = conn.as_mut() => res,
                    };
                    if let Err(err) = res {
                        tracing::warn!(%err, %peer_addr, "Error serving connection");
                    }
                });
            }

            tracing::info!("Stop signal received, Prometheus metrics exporter is shutting down");
            // Send the graceful shutdown signal to all alive connections.
            drop(started_shutdown);
            started_shutdown_sender.send_replace(());
            // Wait until all connections are dropped.
            started_shutdown_sender.closed().await;

            Ok(())
        };

        Ok(MetricsServer {
            server: Box::pin(server),
            local_addr,
        })
    }
}

/// Metrics server bound to a certain local address returned by [`MetricsExporter::bind()`].
///
/// Useful e.g. if you need to find out which port the server was bound to if the 0th port was specified.
#[must_use = "Server should be `start()`ed"]
pub struct MetricsServer<'a> {
    server: Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>,
    local_addr: SocketAddr,
}

impl fmt::Debug for MetricsServer<'_> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MetricsServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl MetricsServer<'_> {
    /// Returns the local address this server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts this server. Resolves once the server is shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting a connection fails.
    pub async fn start(self) -> io::Result<()> {
        self.server.await
    }
}
