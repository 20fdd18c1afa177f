//! Health check probe logic.
//!
//! Performs one bounded HTTP `GET` against a service's health endpoint and
//! classifies the reply. A probe never fails: every outcome, including
//! timeouts and refused connections, is a `HealthCheckResult`.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, LengthLimitError, Limited};
use serde::Deserialize;
use tracing::debug;

use uws_state::{HealthBody, HealthCheckResult, ProbeErrorKind, ServiceDescriptor, ServiceId};

/// Largest health body we are willing to buffer.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a probe needs to know about a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub service_id: ServiceId,
    pub health_url: String,
    pub timeout: Duration,
}

impl ProbeTarget {
    pub fn from_descriptor(desc: &ServiceDescriptor) -> Self {
        Self {
            service_id: desc.id.clone(),
            health_url: desc.health_url.clone(),
            timeout: Duration::from_millis(desc.probe_timeout_ms),
        }
    }
}

/// Performs a single probe. Implementations must honour `target.timeout`
/// and must not panic; the scheduler additionally enforces the bound.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, target: &'a ProbeTarget) -> BoxFuture<'a, HealthCheckResult>;
}

/// Probes over plain HTTP/1.1 using hyper.
#[derive(Debug, Clone, Default)]
pub struct HttpProber;

impl HttpProber {
    pub fn new() -> Self {
        Self
    }
}

impl Prober for HttpProber {
    fn probe<'a>(&'a self, target: &'a ProbeTarget) -> BoxFuture<'a, HealthCheckResult> {
        Box::pin(http_probe(target))
    }
}

/// `detail` field of a `503` reply.
#[derive(Debug, Deserialize)]
struct UnhealthyBody {
    detail: String,
}

/// Failure before a complete response was read.
struct ExchangeError {
    kind: ProbeErrorKind,
    message: String,
}

impl ExchangeError {
    fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Split an `http://host[:port]/path` URL into a connect address, a
/// `Host` header value and the origin-form request target.
pub fn split_health_url(url: &str) -> Option<(String, String, String)> {
    let uri: http::Uri = url.parse().ok()?;
    if uri.scheme_str() != Some("http") {
        return None;
    }
    let authority = uri.authority()?;
    let host = authority.host();
    if host.is_empty() {
        return None;
    }
    let port = authority.port_u16().unwrap_or(80);
    let path = uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    Some((format!("{host}:{port}"), authority.as_str().to_string(), path))
}

/// Perform an HTTP health probe against a service.
pub async fn http_probe(target: &ProbeTarget) -> HealthCheckResult {
    let started = Instant::now();

    let attempt = async {
        let Some((address, host, path)) = split_health_url(&target.health_url) else {
            return Err(ExchangeError::new(
                ProbeErrorKind::MalformedResponse,
                format!("unusable health url {}", target.health_url),
            ));
        };
        exchange(&address, &host, &path).await
    };

    let outcome = match tokio::time::timeout(target.timeout, attempt).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ExchangeError::new(
            ProbeErrorKind::Timeout,
            format!("no response within {}ms", target.timeout.as_millis()),
        )),
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let (http_status, body, detail, error_kind) = match outcome {
        Ok((status, bytes)) => {
            let (body, detail, kind) = classify(status, &bytes);
            (Some(status), body, detail, kind)
        }
        Err(e) => (None, None, Some(e.message), Some(e.kind)),
    };

    debug!(
        service_id = %target.service_id,
        url = %target.health_url,
        status = ?http_status,
        latency_ms,
        outcome = error_kind.map_or("success", |k| k.as_str()),
        "health probe finished"
    );

    HealthCheckResult {
        service_id: target.service_id.clone(),
        observed_at: epoch_millis(),
        http_status,
        latency_ms,
        body,
        detail,
        error_kind,
    }
}

/// One request/response over a fresh connection. The connection driver
/// runs inside this future, so cancelling it closes the socket.
async fn exchange(address: &str, host: &str, path: &str) -> Result<(u16, Bytes), ExchangeError> {
    let stream = tokio::net::TcpStream::connect(address).await.map_err(|e| {
        ExchangeError::new(ProbeErrorKind::ConnectionFailed, format!("connect {address}: {e}"))
    })?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| {
            ExchangeError::new(ProbeErrorKind::ConnectionFailed, format!("handshake: {e}"))
        })?;

    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .header("accept", "application/json")
        .header("user-agent", "uws-health/0.1")
        .body(Empty::<Bytes>::new())
        .map_err(|e| ExchangeError::new(ProbeErrorKind::MalformedResponse, e.to_string()))?;

    let request = async move {
        let resp = sender.send_request(req).await.map_err(|e| {
            let kind = if e.is_parse() || e.is_parse_status() {
                ProbeErrorKind::MalformedResponse
            } else {
                ProbeErrorKind::ConnectionFailed
            };
            ExchangeError::new(kind, format!("request: {e}"))
        })?;
        let status = resp.status().as_u16();
        let collected = Limited::new(resp.into_body(), MAX_BODY_BYTES)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    ExchangeError::new(
                        ProbeErrorKind::MalformedResponse,
                        format!("body exceeds {MAX_BODY_BYTES} bytes"),
                    )
                } else {
                    ExchangeError::new(ProbeErrorKind::ConnectionFailed, format!("body: {e}"))
                }
            })?;
        Ok::<_, ExchangeError>((status, collected.to_bytes()))
    };

    let mut request = std::pin::pin!(request);
    let mut conn = std::pin::pin!(conn);
    tokio::select! {
        biased;
        outcome = &mut request => outcome,
        // The connection ended first; the request resolves on its own now.
        _ = &mut conn => request.await,
    }
}

/// Classify a complete response into `(body, detail, error_kind)`.
pub fn classify(
    status: u16,
    bytes: &[u8],
) -> (Option<HealthBody>, Option<String>, Option<ProbeErrorKind>) {
    match status {
        200 => match serde_json::from_slice::<HealthBody>(bytes) {
            Ok(body) if body.status == "healthy" => (Some(body), None, None),
            Ok(body) => {
                let detail = format!("service reported status {:?}", body.status);
                (Some(body), Some(detail), Some(ProbeErrorKind::ReportedUnhealthy))
            }
            Err(e) => (
                None,
                Some(format!("unparseable health body: {e}")),
                Some(ProbeErrorKind::MalformedResponse),
            ),
        },
        503 => match serde_json::from_slice::<UnhealthyBody>(bytes) {
            Ok(body) => (None, Some(body.detail), Some(ProbeErrorKind::ReportedUnhealthy)),
            Err(e) => (
                None,
                Some(format!("unparseable 503 body: {e}")),
                Some(ProbeErrorKind::MalformedResponse),
            ),
        },
        other => (
            None,
            Some(format!("unexpected status {other}")),
            Some(ProbeErrorKind::MalformedResponse),
        ),
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
