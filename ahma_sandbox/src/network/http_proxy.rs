//! # HTTP/HTTPS Forward Proxy
//!
//! A loopback forward proxy that consults the [`DomainFilter`] before anything
//! else happens on a request:
//!
//! - `CONNECT host:port` dials the target with a bounded timeout, answers
//!   `200`, then relays bytes in both directions until either side closes.
//!   Payloads are never inspected.
//! - Absolute-form plain HTTP requests are rewritten to origin-form, stripped
//!   of hop-by-hop headers, and forwarded. The response is stripped the same
//!   way and its body streamed back unmodified.
//!
//! Rejected domains get `403` with `X-Proxy-Error: blocked-by-allowlist`.
//! Unreachable targets get `502`; a dial failure never takes the proxy down.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::DomainFilter;
use super::proxy::{ProxyHandle, ProxyKind, bind_loopback};
use crate::sandbox::{SandboxError, SandboxResult};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub const BLOCKED_HEADER: &str = "x-proxy-error";
pub const BLOCKED_VALUE: &str = "blocked-by-allowlist";
pub const BLOCKED_BODY: &str = "Domain not allowed by sandbox policy";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Bind the HTTP proxy on `127.0.0.1:<port>` and start serving.
///
/// The accept loop exits when `shutdown` is cancelled.
pub async fn start_http_proxy(
    filter: Arc<DomainFilter>,
    port: u16,
    shutdown: CancellationToken,
) -> SandboxResult<ProxyHandle> {
    let (listener, port) = bind_loopback(port).await?;
    info!(port, "HTTP proxy listening");

    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let filter = filter.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_client(stream, filter).await {
                                debug!(%peer, error = %e, "HTTP proxy connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "HTTP proxy failed to accept connection"),
                },
            }
        }
    });

    Ok(ProxyHandle::new(ProxyKind::Http, port, shutdown, task))
}

async fn serve_client(stream: TcpStream, filter: Arc<DomainFilter>) -> Result<(), hyper::Error> {
    let service = service_fn(move |req: Request<Incoming>| {
        let filter = filter.clone();
        async move { Ok::<_, hyper::Error>(handle_request(req, &filter).await) }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
}

async fn handle_request(req: Request<Incoming>, filter: &DomainFilter) -> Response<BoxBody> {
    let Some(host) = request_host(&req) else {
        return text_response(StatusCode::BAD_REQUEST, "Missing target host");
    };

    if !filter.is_allowed(&host) {
        debug!(domain = %host, method = %req.method(), "HTTP proxy blocked request");
        return blocked_response();
    }

    if req.method() == Method::CONNECT {
        handle_connect(req).await
    } else {
        forward(req).await
    }
}

/// Host named by the request: the authority for `CONNECT`, the absolute URI
/// otherwise, falling back to the `Host` header.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.host().to_string());
    }
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

async fn handle_connect(req: Request<Incoming>) -> Response<BoxBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return text_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
    };
    let target = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(443));

    let upstream = match dial(&target, CONNECT_TIMEOUT).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(error = %e, "HTTP proxy failed to connect");
            return text_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                let mut upstream = upstream;
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((up, down)) => debug!(%target, up, down, "tunnel closed"),
                    Err(e) => debug!(%target, error = %e, "tunnel ended with error"),
                }
            }
            Err(e) => debug!(%target, error = %e, "CONNECT upgrade failed"),
        }
    });

    Response::new(empty_body())
}

async fn forward(req: Request<Incoming>) -> Response<BoxBody> {
    match tokio::time::timeout(UPSTREAM_TIMEOUT, send_upstream(req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(ForwardError::Unsupported(reason))) => {
            text_response(StatusCode::NOT_IMPLEMENTED, reason)
        }
        Ok(Err(ForwardError::Upstream(e))) => {
            debug!(error = %e, "HTTP proxy request failed");
            text_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Err(_) => text_response(StatusCode::GATEWAY_TIMEOUT, "Upstream request timed out"),
    }
}

enum ForwardError {
    Unsupported(String),
    Upstream(SandboxError),
}

async fn send_upstream(req: Request<Incoming>) -> Result<Response<BoxBody>, ForwardError> {
    let (mut parts, body) = req.into_parts();

    if let Some(scheme) = parts.uri.scheme_str()
        && scheme != "http"
    {
        return Err(ForwardError::Unsupported(format!(
            "Scheme '{scheme}' must be tunnelled with CONNECT"
        )));
    }

    let authority = match parts.uri.authority() {
        Some(authority) => authority.clone(),
        None => parts
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| ForwardError::Unsupported("Missing target host".to_string()))?,
    };
    let target = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

    let stream = dial(&target, UPSTREAM_TIMEOUT)
        .await
        .map_err(ForwardError::Upstream)?;
    let upstream_error = |e: hyper::Error| {
        ForwardError::Upstream(SandboxError::ProxyDialFailed {
            target: target.clone(),
            reason: e.to_string(),
        })
    };

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(upstream_error)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "upstream connection closed with error");
        }
    });

    parts.uri = origin_form(&parts.uri);
    strip_hop_by_hop(&mut parts.headers);
    if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
        parts.headers.insert(header::HOST, host);
    }

    let response = sender
        .send_request(Request::from_parts(parts, body))
        .await
        .map_err(upstream_error)?;

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, body.boxed()))
}

async fn dial(target: &str, timeout: Duration) -> SandboxResult<TcpStream> {
    let failed = |reason: String| SandboxError::ProxyDialFailed {
        target: target.to_string(),
        reason,
    };
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(failed(e.to_string())),
        Err(_) => Err(failed(format!("timed out after {}s", timeout.as_secs()))),
    }
}

fn origin_form(uri: &Uri) -> Uri {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .unwrap_or_else(|_| Uri::from_static("/"))
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name);
    }
}

fn blocked_response() -> Response<BoxBody> {
    let mut response = text_response(StatusCode::FORBIDDEN, BLOCKED_BODY);
    response.headers_mut().insert(
        HeaderName::from_static(BLOCKED_HEADER),
        HeaderValue::from_static(BLOCKED_VALUE),
    );
    response
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn full_body(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

fn empty_body() -> BoxBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_standard_and_listed_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-session", HeaderValue::from_static("1"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn absolute_uri_becomes_origin_form() {
        let uri: Uri = "http://example.com:8080/a/b?c=d".parse().unwrap();
        assert_eq!(origin_form(&uri), "/a/b?c=d");

        let bare: Uri = "http://example.com".parse().unwrap();
        assert_eq!(origin_form(&bare), "/");
    }

    #[test]
    fn host_comes_from_authority_then_header() {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("github.com:443")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("github.com"));

        let req = Request::builder()
            .uri("/index.html")
            .header(header::HOST, "example.org:8080")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("example.org:8080"));

        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn blocked_response_carries_marker() {
        let response = blocked_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[BLOCKED_HEADER], BLOCKED_VALUE);
    }

    #[tokio::test]
    async fn dial_failure_is_reported_not_raised() {
        let (listener, port) = bind_loopback(0).await.unwrap();
        drop(listener);
        let err = dial(&format!("127.0.0.1:{port}"), CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ProxyDialFailed { .. }));
    }
}
