//! The HTTP server.
//!
//! Connections are served by hyper's HTTP/1.1 implementation. Each request
//! is converted into a [`Request`], answered by the [`Router`] on the
//! blocking pool, and converted back.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::http::{Request, Response};
use crate::router::{error_response, Router};
use akadb_core::Cluster;
use akadb_replication::ReplicationCoordinator;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::StatusCode;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

type HttpResponse = hyper::Response<Full<Bytes>>;

/// HTTP front end for a cluster.
///
/// Each connection runs on its own task. Handlers touch the stores under
/// blocking locks, so dispatch happens on the blocking pool.
///
/// # Example
///
/// ```no_run
/// use akadb_core::Cluster;
/// use akadb_server::{AkaServer, ServerConfig};
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let cluster = Arc::new(Cluster::in_memory(3)?);
/// let server = AkaServer::new(ServerConfig::default(), cluster, None);
/// server.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
/// # Ok(())
/// # }
/// ```
pub struct AkaServer {
    router: Arc<Router>,
    context: Arc<HandlerContext>,
}

impl AkaServer {
    /// Creates a server over `cluster`.
    pub fn new(
        config: ServerConfig,
        cluster: Arc<Cluster>,
        replication: Option<Arc<ReplicationCoordinator>>,
    ) -> Self {
        let context = Arc::new(HandlerContext::new(config, cluster, replication));
        let router = Arc::new(Router::new(RequestHandler::new(Arc::clone(&context))));
        Self { router, context }
    }

    /// The server's configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// The handler context.
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Answers one request without a socket.
    pub fn dispatch(&self, request: &Request) -> Response {
        self.router.dispatch(request)
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> ServerResult<TcpListener> {
        Ok(TcpListener::bind(self.context.config.bind_addr).await?)
    }

    /// Binds and serves until `shutdown` completes.
    pub async fn run<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serves connections from `listener` until `shutdown` completes.
    ///
    /// Open connections finish the request they are on; no new connections
    /// are accepted after shutdown.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        info!(%addr, local_node = %self.context.config.local_node, "server listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let router = Arc::clone(&self.router);
                        let config = self.context.config.clone();
                        tokio::spawn(serve_connection(router, config, stream, peer));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                () = &mut shutdown => {
                    info!(%addr, "server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn serve_connection(
    router: Arc<Router>,
    config: ServerConfig,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let timeout = config.request_timeout;
    let service = service_fn(move |request| {
        let router = Arc::clone(&router);
        let config = config.clone();
        async move { Ok::<_, Infallible>(answer(router, &config, request, peer).await) }
    });

    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeout)
        .serve_connection(TokioIo::new(stream), service);
    if let Err(e) = connection.await {
        debug!(%peer, error = %e, "connection closed with error");
    }
}

async fn answer(
    router: Arc<Router>,
    config: &ServerConfig,
    request: hyper::Request<Incoming>,
    peer: SocketAddr,
) -> HttpResponse {
    let read = tokio::time::timeout(
        config.request_timeout,
        read_request(request, config.max_body_bytes),
    )
    .await
    .unwrap_or_else(|_| Err(ServerError::invalid("request body timed out")));

    let response = match read {
        Ok(request) => tokio::task::spawn_blocking(move || router.dispatch(&request))
            .await
            .unwrap_or_else(|e| {
                warn!(%peer, error = %e, "handler task failed");
                error_response(&ServerError::Io(std::io::Error::other(e.to_string())))
            }),
        Err(e) => {
            debug!(%peer, error = %e, "request rejected");
            error_response(&e)
        }
    };
    to_hyper(response)
}

/// Collects a hyper request into a [`Request`], enforcing the body limit.
async fn read_request(request: hyper::Request<Incoming>, max_body: usize) -> ServerResult<Request> {
    let (parts, body) = request.into_parts();

    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|length| length > max_body) {
        return Err(ServerError::PayloadTooLarge { limit: max_body });
    }

    let target = parts
        .uri
        .path_and_query()
        .map_or("/", |target| target.as_str());
    let mut converted = Request::new(parts.method.as_str(), target);
    converted.headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect();

    let body = Limited::new(body, max_body)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                ServerError::PayloadTooLarge { limit: max_body }
            } else {
                ServerError::Io(std::io::Error::other(e))
            }
        })?;
    converted.body = body.to_bytes().to_vec();
    Ok(converted)
}

fn to_hyper(response: Response) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = hyper::Response::new(Full::new(Bytes::from(response.body)));
    *out.status_mut() = status;

    let headers = out.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(response.content_type),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    out
}
