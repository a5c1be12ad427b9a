//! Maps requests onto handlers.

use crate::error::{ServerError, ServerResult};
use crate::handler::{MoviesQuery, RequestHandler};
use crate::http::{Request, Response};
use akadb_core::{RecordFilter, TransactionId};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    kind: &'a str,
    logs: Vec<String>,
}

/// Routes decoded requests to a [`RequestHandler`].
pub struct Router {
    handler: RequestHandler,
}

impl Router {
    /// Creates a router over `handler`.
    pub fn new(handler: RequestHandler) -> Self {
        Self { handler }
    }

    /// The wrapped handler.
    pub fn handler(&self) -> &RequestHandler {
        &self.handler
    }

    /// Answers one request. Failures become JSON error bodies.
    pub fn dispatch(&self, request: &Request) -> Response {
        if request.method == "OPTIONS" {
            return Response::empty(204);
        }
        match self.route(request) {
            Ok(response) => {
                debug!(method = %request.method, path = %request.path, status = response.status, "request handled");
                response
            }
            Err(e) => {
                let status = e.status_code();
                if e.is_server_error() {
                    warn!(method = %request.method, path = %request.path, status, error = %e, "request failed");
                } else {
                    debug!(method = %request.method, path = %request.path, status, error = %e, "request rejected");
                }
                error_response(&e)
            }
        }
    }

    fn route(&self, request: &Request) -> ServerResult<Response> {
        let h = &self.handler;
        let path = request.path.trim_end_matches('/');
        match (request.method.as_str(), path) {
            ("GET", "/status") => ok(&h.handle_status()),
            ("POST", "/settings") => ok(&h.handle_settings(request.json()?)?),
            ("GET", "/movies") => ok(&h.handle_movies(movies_query(request)?)?),
            ("POST", "/insert") => ok(&h.handle_insert(request.json()?)?),
            ("POST", "/update") => ok(&h.handle_update(request.json()?)?),
            ("POST", "/delete") => ok(&h.handle_delete(request.json()?)?),
            ("POST", "/simulate-concurrency") => ok(&h.handle_simulate(request.json()?)?),
            ("GET", "/transactions") => ok(&h.handle_transactions()),
            ("POST", "/begin") => ok(&h.handle_begin(request.json()?)?),
            ("POST", "/commit") => ok(&h.handle_commit(request.json()?)?),
            ("POST", "/abort") => ok(&h.handle_abort(request.json()?)?),
            ("POST", "/node-state") => ok(&h.handle_node_state(request.json()?)?),
            ("POST", "/recover") => ok(&h.handle_recover(request.json()?)?),
            ("POST", "/replication/reset") => ok(&h.handle_replication_reset(request.json()?)?),
            ("GET", "/logs") => ok(&h.handle_logs(
                request.parse_param("node")?,
                request.parse_param("limit")?,
            )?),
            ("GET", p) if p.starts_with("/report/") => {
                let kind = &p["/report/".len()..];
                ok(&h.handle_report(kind, request.parse_param("node")?)?)
            }
            _ => Err(ServerError::RouteNotFound {
                method: request.method.clone(),
                path: request.path.clone(),
            }),
        }
    }
}

fn ok<T: Serialize>(value: &T) -> ServerResult<Response> {
    Ok(Response::json(200, value))
}

/// JSON body for a failed request.
pub fn error_response(error: &ServerError) -> Response {
    let kind = error.kind();
    let message = error.to_string();
    Response::json(
        error.status_code(),
        &ErrorBody {
            logs: vec![format!("{kind}: {message}")],
            error: message,
            kind,
        },
    )
}

fn movies_query(request: &Request) -> ServerResult<MoviesQuery> {
    Ok(MoviesQuery {
        node: request.parse_param("node")?,
        offset: request.parse_param("offset")?,
        page: request.parse_param("page")?,
        limit: request.parse_param("limit")?,
        filter: RecordFilter {
            title_id: request.param("titleId").map(str::to_owned),
            title: request.param("title").map(str::to_owned),
            region: request.param("region").map(str::to_owned),
        },
        txn_id: request.param("txnId").map(parse_txn).transpose()?,
    })
}

/// Accepts `7` and `txn:7`.
fn parse_txn(raw: &str) -> ServerResult<TransactionId> {
    let digits = raw.strip_prefix("txn:").unwrap_or(raw);
    digits
        .parse::<u64>()
        .map(TransactionId::new)
        .map_err(|_| ServerError::invalid(format!("parameter `txnId`: invalid transaction id {raw:?}")))
}
