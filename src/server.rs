use anyhow::Result;
use futures::stream::{self, StreamExt};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchError, ModeController};
use crate::http_client::is_hop_by_hop;
use crate::mitm::TlsInterceptor;
use crate::record::{ArchivedRequest, ArchivedResponse, HeaderList};

pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// Shared by every connection
pub struct ServerContext {
    pub controller: Arc<ModeController>,
    pub interceptor: Arc<TlsInterceptor>,
    /// Sleep the recorded header and chunk delays while responding
    pub use_delays: bool,
}

impl ServerContext {
    pub fn new(controller: Arc<ModeController>, interceptor: Arc<TlsInterceptor>, use_delays: bool) -> Self {
        Self {
            controller,
            interceptor,
            use_delays,
        }
    }
}

/// Accept plain HTTP connections (including proxy requests and CONNECT)
pub async fn run_http_listener(listener: TcpListener, ctx: Arc<ServerContext>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP listener started");

    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);

        tokio::spawn(async move {
            debug!(peer = %peer, "HTTP connection accepted");
            serve_connection(stream, ctx, None).await;
        });
    }
}

/// Accept TLS connections, intercepting each one by SNI
pub async fn run_https_listener(listener: TcpListener, ctx: Arc<ServerContext>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "HTTPS listener started");

    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);

        tokio::spawn(async move {
            let intercepted = ctx.interceptor.accept(stream).await;
            match intercepted {
                Ok(tls) => {
                    let host = tls.server_name().to_string();
                    serve_connection(tls, ctx, Some(host)).await;
                }
                Err(e) => warn!(peer = %peer, error = %e, "TLS interception failed"),
            }
        });
    }
}

/// Serve HTTP/1.1 on any byte stream.
///
/// `tls_host` is set when the stream is an intercepted TLS connection; it
/// marks requests as secure and names the host when a request has none.
pub async fn serve_connection<S>(stream: S, ctx: Arc<ServerContext>, tls_host: Option<String>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let tls_host: Option<Arc<str>> = tls_host.map(Arc::from);

    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(
            io,
            service_fn(move |req| {
                let ctx = Arc::clone(&ctx);
                let tls_host = tls_host.clone();
                async move { handle_request(req, ctx, tls_host).await }
            }),
        )
        .with_upgrades(); // Enable HTTP upgrades for CONNECT

    if let Err(e) = conn.await {
        debug!(error = %e, "HTTP/1.1 connection error");
    }
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ServerContext>,
    tls_host: Option<Arc<str>>,
) -> Result<Response<ResponseBody>, Infallible> {
    debug!(method = %req.method(), uri = %req.uri(), "Received request");

    if req.method() == Method::CONNECT {
        if tls_host.is_some() {
            return Ok(text_response(StatusCode::BAD_REQUEST, "Nested CONNECT is not supported"));
        }
        return Ok(handle_connect(req, ctx));
    }

    let is_head = req.method() == Method::HEAD;
    let request = match to_archived_request(req, tls_host.as_deref()).await {
        Ok(request) => request,
        Err(msg) => {
            warn!(error = %msg, "Rejecting malformed request");
            return Ok(text_response(StatusCode::BAD_REQUEST, msg));
        }
    };

    match ctx.controller.dispatch(&request).await {
        Ok(response) => Ok(build_response(&response, ctx.use_delays, is_head).await),
        Err(DispatchError::Miss { reason }) => Ok(text_response(StatusCode::NOT_FOUND, reason)),
        Err(e @ DispatchError::FetchFailed(_)) => {
            error!(request = %request, error = %e, "Serving 502");
            Ok(text_response(StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

/// Answer CONNECT and intercept the tunnelled TLS connection
fn handle_connect<B>(mut req: Request<B>, ctx: Arc<ServerContext>) -> Response<ResponseBody>
where
    B: Body + Send + 'static,
{
    let authority = match req.uri().authority() {
        Some(auth) => auth.to_string(),
        None => {
            warn!("[CONNECT] Missing authority in CONNECT request");
            return text_response(
                StatusCode::BAD_REQUEST,
                "Bad Request: CONNECT requires a valid host:port authority",
            );
        }
    };

    debug!(authority = %authority, "[CONNECT] Intercepting tunnel");

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let intercepted = ctx.interceptor.accept(TokioIo::new(upgraded)).await;
                match intercepted {
                    Ok(tls) => {
                        let host = tls.server_name().to_string();
                        serve_connection(tls, ctx, Some(host)).await;
                    }
                    Err(e) => warn!(authority = %authority, error = %e, "[CONNECT] TLS interception failed"),
                }
            }
            Err(e) => error!(authority = %authority, error = %e, "[CONNECT] Upgrade error"),
        }
    });

    Response::new(empty_body())
}

/// Canonical request from a parsed HTTP request
async fn to_archived_request<B>(req: Request<B>, tls_host: Option<&str>) -> Result<ArchivedRequest, String>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();

    // Absolute-form (proxy request) wins over Host, which wins over SNI
    let host = parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(http::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .or_else(|| tls_host.map(str::to_string))
        .ok_or_else(|| "Request has no host".to_string())?;

    let is_secure = match parts.uri.scheme_str() {
        Some(scheme) => scheme.eq_ignore_ascii_case("https"),
        None => tls_host.is_some(),
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let headers: HeaderList = parts
        .headers
        .iter()
        .filter_map(|(name, value)| match value.to_str() {
            Ok(v) => Some((name.as_str().to_string(), v.to_string())),
            Err(_) => {
                debug!(header = %name, "Skipping non-UTF-8 request header");
                None
            }
        })
        .collect();

    let body = body
        .collect()
        .await
        .map_err(|e| format!("Failed to read request body: {}", e))?
        .to_bytes();

    Ok(ArchivedRequest::new(
        parts.method.as_str(),
        host,
        path,
        headers,
        Some(body),
        is_secure,
    ))
}

/// Serialize an archived response, optionally replaying its timing
async fn build_response(response: &ArchivedResponse, use_delays: bool, is_head: bool) -> Response<ResponseBody> {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let bodiless = is_head || status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED;

    let mut builder = Response::builder().status(status);

    if status.canonical_reason() != Some(response.reason_phrase.as_str()) && !response.reason_phrase.is_empty() {
        if let Ok(reason) = hyper::ext::ReasonPhrase::try_from(response.reason_phrase.clone()) {
            builder = builder.extension(reason);
        }
    }

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in response.headers.iter() {
            let lower = name.to_ascii_lowercase();
            // HEAD keeps the length the GET would have had
            if is_hop_by_hop(&lower) || (lower == "content-length" && !is_head) {
                continue;
            }
            match (http::HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!(header = %name, "Skipping unrepresentable header"),
            }
        }
        if !bodiless {
            headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(response.body_len()));
        }
    }

    let body = if bodiless {
        empty_body()
    } else if use_delays {
        let header_delay = response.timing().header_delay_ms.max(0) as u64;
        tokio::time::sleep(Duration::from_millis(header_delay)).await;
        delayed_body(response)
    } else {
        Full::new(response.body()).boxed_unsync()
    };

    match builder.body(body) {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, "Failed to build response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to build response")
        }
    }
}

/// Body that waits out each chunk's recorded delay before sending it
fn delayed_body(response: &ArchivedResponse) -> ResponseBody {
    let chunks: Vec<(Bytes, u64)> = response
        .body_chunks()
        .iter()
        .cloned()
        .zip(response.timing().chunk_delays_ms.iter().copied())
        .collect();

    let frames = stream::iter(chunks).then(|(chunk, delay_ms)| async move {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Ok::<_, Infallible>(Frame::data(chunk))
    });

    StreamBody::new(frames).boxed_unsync()
}

fn empty_body() -> ResponseBody {
    Full::new(Bytes::new()).boxed_unsync()
}

fn text_response(status: StatusCode, text: impl Into<String>) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from(text.into())).boxed_unsync());
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ResponseTiming;
    use http_body_util::Empty;

    #[tokio::test]
    async fn test_absolute_form_request() {
        let req = Request::builder()
            .method("GET")
            .uri("http://a.com:8080/x?y=1")
            .header("Host", "ignored.com")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let archived = to_archived_request(req, None).await.unwrap();
        assert_eq!(archived.host, "a.com:8080");
        assert_eq!(archived.path, "/x?y=1");
        assert!(!archived.is_secure);
        assert!(archived.body.is_none());
        assert_eq!(archived.headers.get("host"), Some("ignored.com"));
    }

    #[tokio::test]
    async fn test_intercepted_request_is_secure() {
        let req = Request::builder()
            .method("POST")
            .uri("/submit")
            .body(Full::new(Bytes::from_static(b"data")))
            .unwrap();

        let archived = to_archived_request(req, Some("sni.example")).await.unwrap();
        assert_eq!(archived.host, "sni.example");
        assert!(archived.is_secure);
        assert_eq!(archived.body, Some(Bytes::from_static(b"data")));
    }

    #[tokio::test]
    async fn test_non_utf8_request_header_skipped() {
        let req = Request::builder()
            .uri("http://a.com/")
            .header("x-bin", HeaderValue::from_bytes(b"\xff").unwrap())
            .header("x-text", "kept")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let archived = to_archived_request(req, None).await.unwrap();
        assert_eq!(archived.headers.get("x-bin"), None);
        assert_eq!(archived.headers.get("x-text"), Some("kept"));
    }

    #[tokio::test]
    async fn test_missing_host_rejected() {
        let req = Request::builder()
            .uri("/")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(to_archived_request(req, None).await.is_err());
    }

    #[tokio::test]
    async fn test_build_response_recomputes_length_and_strips_hop_by_hop() {
        let mut headers = HeaderList::new();
        headers.push("Transfer-Encoding", "chunked");
        headers.push("Content-Length", "999");
        headers.push("Set-Cookie", "a=1");
        headers.push("Set-Cookie", "b=2");
        let response = ArchivedResponse::new(
            11,
            200,
            "OK",
            headers,
            vec![Bytes::from_static(b"Wiki"), Bytes::from_static(b"pedia")],
            ResponseTiming {
                header_delay_ms: -5,
                chunk_delays_ms: vec![0, 1],
            },
        )
        .unwrap();

        let built = build_response(&response, true, false).await;
        assert_eq!(built.status(), StatusCode::OK);
        assert!(built.headers().get("transfer-encoding").is_none());
        assert_eq!(built.headers()["content-length"], "9");
        assert_eq!(built.headers().get_all("set-cookie").iter().count(), 2);

        let body = built.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Wikipedia");
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let mut headers = HeaderList::new();
        headers.push("Content-Length", "1234");
        let response = ArchivedResponse::simple(200, "OK", headers, Bytes::new());

        let built = build_response(&response, false, true).await;
        assert_eq!(built.headers()["content-length"], "1234");
        let body = built.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }
}
