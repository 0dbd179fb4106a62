use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body::{Body as HttpBody, Frame};
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::Incoming;
use tokio::io::BufReader;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::headers;
use crate::http::{empty_body, full_body, incoming_to_body, Body, BoxError};
use crate::switch::{SwitchGate, Verdict};
use crate::Shared;

/// Run one request cycle: build the origin request, issue it, and either
/// relay the response or arm the tunnel handoff on a protocol switch.
pub(crate) async fn handle(
    shared: &Shared,
    mut req: Request<Incoming>,
) -> Result<Response<Body>, BoxError> {
    let started = Instant::now();
    let client_upgrade = hyper::upgrade::on(&mut req);
    let mut gate = SwitchGate::new();

    let (parts, body) = req.into_parts();
    let outbound = headers::derive(&parts.headers, shared.policy.as_ref());
    let uri = join_target(&shared.target, &parts.uri)?;

    let body_bytes = body.collect().await?.to_bytes();
    let mut builder = Request::builder().method(parts.method.clone()).uri(uri.clone());
    if let Some(h) = builder.headers_mut() {
        *h = outbound;
    }
    let origin_req = builder.body(if body_bytes.is_empty() {
        empty_body()
    } else {
        full_body(body_bytes)
    })?;

    let origin_started = Instant::now();
    let mut origin_resp = shared.client.request(origin_req).await?;
    let head_received = Instant::now();
    let status = origin_resp.status();
    let origin_latency = head_received.duration_since(origin_started);

    match gate.observe(status) {
        Verdict::Switch => {
            let origin_upgrade = hyper::upgrade::on(&mut origin_resp);
            let (resp_parts, _) = origin_resp.into_parts();
            gate.handoff(client_upgrade, origin_upgrade);
            LatencyRecord {
                total: started.elapsed(),
                origin: origin_latency,
            }
            .emit(status, &parts.method, &uri);
            Ok(Response::from_parts(resp_parts, empty_body()))
        }
        Verdict::Passthrough => {
            let (mut resp_parts, origin_body) = origin_resp.into_parts();
            let mut body = incoming_to_body(origin_body);
            if is_gzip(&resp_parts.headers) {
                // The relayed bytes are no longer the encoded ones.
                resp_parts.headers.remove(CONTENT_ENCODING);
                resp_parts.headers.remove(CONTENT_LENGTH);
                body = inflate_body(body);
            }
            let metered = MeteredBody {
                inner: body,
                status,
                method: parts.method,
                uri,
                started,
                origin: origin_latency,
                finished: false,
            };
            Ok(Response::from_parts(resp_parts, BodyExt::boxed(metered)))
        }
    }
}

fn join_target(target: &str, inbound: &Uri) -> Result<Uri, BoxError> {
    let pq = inbound
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Ok(format!("{target}{pq}").parse()?)
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

/// Stream the body through a gzip decoder chunk by chunk; nothing is
/// buffered beyond the decoder's own window.
fn inflate_body(body: Body) -> Body {
    let stream = BodyStream::new(body)
        .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
        .map_err(io::Error::other);
    let reader = BufReader::new(StreamReader::new(Box::pin(stream)));
    let decoded = GzipDecoder::new(reader);

    BodyExt::boxed(StreamBody::new(
        ReaderStream::new(decoded)
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError),
    ))
}

/// Millisecond timings for one proxied request: wall-clock total, origin
/// round-trip, and the difference as the proxy's own overhead.
struct LatencyRecord {
    total: Duration,
    origin: Duration,
}

impl LatencyRecord {
    fn emit(&self, status: StatusCode, method: &Method, uri: &Uri) {
        let overhead = self.total.saturating_sub(self.origin);
        tracing::debug!(
            status = status.as_u16(),
            method = %method,
            uri = %uri,
            total_ms = self.total.as_millis() as u64,
            origin_ms = self.origin.as_millis() as u64,
            overhead_ms = overhead.as_millis() as u64,
            "proxied"
        );
    }
}

/// Response body wrapper that emits the cycle's latency record once the
/// last chunk has been relayed to the client.
struct MeteredBody {
    inner: Body,
    status: StatusCode,
    method: Method,
    uri: Uri,
    started: Instant,
    origin: Duration,
    finished: bool,
}

impl HttpBody for MeteredBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    LatencyRecord {
                        total: this.started.elapsed(),
                        origin: this.origin,
                    }
                    .emit(this.status, &this.method, &this.uri);
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(uri = %self.uri, "response relay ended before completion");
        }
    }
}
