// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use logservice::Pipeline;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Largest request body accepted from a drain.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// How long open connections get to finish once the listener stops.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const INGEST_OK: &str = "{\"error\":false}\n";
const INGEST_FAILED: &str = "{\"error\":true}\n";

/// Routes one request. Only `/` is served.
pub async fn handle<B>(
    pipeline: Arc<Pipeline>,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let target = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    if target != "/" {
        return Ok(error_response(&method, StatusCode::NOT_FOUND, "Not found\n"));
    }

    let response = match method {
        Method::GET | Method::HEAD => respond(&method, StatusCode::OK, "OK\n", TEXT_PLAIN),
        Method::POST => ingest(&pipeline, req.into_body()).await,
        _ => error_response(
            &method,
            StatusCode::METHOD_NOT_ALLOWED,
            "Unsupported method\n",
        ),
    };
    Ok(response)
}

/// Feeds every line of the body to the pipeline, stopping at the first
/// error.
async fn ingest<B>(pipeline: &Pipeline, body: B) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!("LOGSERVICE | ingest: read: {e}");
            return error_response(
                &Method::POST,
                StatusCode::INTERNAL_SERVER_ERROR,
                INGEST_FAILED,
            );
        }
    };

    let mut accepted = 0;
    for line in body.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        match pipeline.ingest(line).await {
            Ok(0) => {}
            Ok(_) => accepted += 1,
            Err(e) => {
                error!("LOGSERVICE | ingest: write: {e}");
                return error_response(
                    &Method::POST,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INGEST_FAILED,
                );
            }
        }
    }
    debug!("LOGSERVICE | Accepted {accepted} records from {} bytes", body.len());

    respond(&Method::POST, StatusCode::OK, INGEST_OK, "application/json")
}

fn error_response(
    method: &Method,
    status: StatusCode,
    msg: &'static str,
) -> Response<Full<Bytes>> {
    debug!("LOGSERVICE | Server error: {}", msg.trim_end());
    respond(method, status, msg, TEXT_PLAIN)
}

fn respond(
    method: &Method,
    status: StatusCode,
    body: &'static str,
    content_type: &'static str,
) -> Response<Full<Bytes>> {
    let body = if method == Method::HEAD {
        Bytes::new()
    } else {
        Bytes::from_static(body.as_bytes())
    };
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Accepts connections until `cancel` fires, then lets open connections
/// finish their in-flight requests.
pub async fn serve(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = JoinSet::new();

    loop {
        let conn = tokio::select! {
            () = cancel.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("LOGSERVICE | Server error: {e}");
                    return Err(e.into());
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("LOGSERVICE | Connection handler panicked: {e:?}");
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };

        let conn = TokioIo::new(conn);
        let server = server.clone();
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        joinset.spawn(async move {
            let service = service_fn(move |req| handle(Arc::clone(&pipeline), req));
            let mut conn = std::pin::pin!(server.serve_connection(conn, service));
            let result = tokio::select! {
                result = conn.as_mut() => result,
                () = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(e) = result {
                error!("LOGSERVICE | Connection error: {e}");
            }
        });
    }

    debug!(
        "LOGSERVICE | Listener stopped, waiting for {} connections",
        joinset.len()
    );
    let drain = async {
        while let Some(finished) = joinset.join_next().await {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("LOGSERVICE | Connection handler panicked: {e:?}");
                }
            }
        }
    };
    if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, drain).await.is_err() {
        error!("LOGSERVICE | Open connections did not finish in time, closing them");
        joinset.abort_all();
    }
    Ok(())
}
