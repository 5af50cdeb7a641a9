//! Request execution against the local origin.
//!
//! Request frames become hyper requests to the configured origin; response
//! status, headers and body stream back as frames. Uploads and downloads for
//! one request proceed full duplex: the streamed request body is fed from
//! `body` frames while the response is already being read.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Body as _, Frame, Incoming};
use hyper::{header, Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde_bytes::ByteBuf;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use burrow_core::{ClientFrame, RequestId, ServerFrame};

use crate::config::LocalOrigin;
use crate::tunnel::Session;
use crate::wsproxy;

/// Streamed request-body chunks buffered per request before the control
/// channel reader starts blocking.
const BODY_CHANNEL_CAPACITY: usize = 64;

type OriginBody = BoxBody<Bytes, Infallible>;

/// Body variants a proxied request can carry.
enum RequestBody {
    Empty,
    Full(Bytes),
    Streaming(mpsc::Receiver<Bytes>),
}

/// Dispatch one frame from the server.
pub async fn handle_frame(session: &Arc<Session>, frame: ServerFrame) {
    match frame {
        ServerFrame::Header {
            request_id,
            method,
            path,
            headers,
            eof,
        } => {
            if method == "GET" && is_websocket_upgrade(&headers) {
                let session = session.clone();
                let id = request_id.clone();
                spawn_tracked(session.clone(), request_id, async move {
                    wsproxy::run_tunnel(session, id, path, headers).await;
                });
                return;
            }

            let body = if eof {
                RequestBody::Empty
            } else {
                let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
                session.body_writers.insert(request_id.clone(), tx);
                RequestBody::Streaming(rx)
            };
            let session = session.clone();
            let id = request_id.clone();
            spawn_tracked(session.clone(), request_id, async move {
                execute(session, id, method, path, headers, body).await;
            });
        }
        ServerFrame::Request {
            request_id,
            method,
            path,
            headers,
            body,
        } => {
            let body = match body {
                Some(data) => RequestBody::Full(Bytes::from(data.into_vec())),
                None => RequestBody::Empty,
            };
            let session = session.clone();
            let id = request_id.clone();
            spawn_tracked(session.clone(), request_id, async move {
                execute(session, id, method, path, headers, body).await;
            });
        }
        ServerFrame::Body {
            request_id,
            data,
            eof,
        } => {
            let writer = match session.body_writers.get(&request_id) {
                Some(writer) => writer.clone(),
                None => {
                    debug!("request body for unknown request {}", request_id);
                    return;
                }
            };
            if let Some(data) = data {
                if !data.is_empty()
                    && writer.send(Bytes::from(data.into_vec())).await.is_err()
                {
                    session.body_writers.remove(&request_id);
                    return;
                }
            }
            if eof {
                session.body_writers.remove(&request_id);
            }
        }
        ServerFrame::Abort { request_id } => {
            session.body_writers.remove(&request_id);
            if let Some((_, task)) = session.inflight.remove(&request_id) {
                task.abort();
                debug!("aborted request {}", request_id);
            }
        }
    }
}

fn spawn_tracked(
    session: Arc<Session>,
    request_id: RequestId,
    work: impl Future<Output = ()> + Send + 'static,
) {
    let cleanup_session = session.clone();
    let cleanup_id = request_id.clone();
    let task = tokio::spawn(async move {
        work.await;
        cleanup_session.inflight.remove(&cleanup_id);
    });
    session.inflight.insert(request_id, task);
}

async fn execute(
    session: Arc<Session>,
    request_id: RequestId,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: RequestBody,
) {
    match forward_to_origin(&session.origin, &method, &path, &headers, body).await {
        Ok(response) => relay_response(&session, request_id, response).await,
        Err(e) => {
            warn!("local origin request failed for {}: {:#}", request_id, e);
            let _ = session
                .send_frame(ClientFrame::Header {
                    request_id,
                    status: 502,
                    status_text: "Bad Gateway".to_string(),
                    headers: Vec::new(),
                    eof: true,
                })
                .await;
        }
    }
}

/// Issue the request against the local origin and await its header section.
async fn forward_to_origin(
    origin: &LocalOrigin,
    method: &str,
    path: &str,
    headers: &[(String, String)],
    body: RequestBody,
) -> anyhow::Result<Response<Incoming>> {
    let stream = TcpStream::connect(&origin.addr).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("origin connection error: {}", e);
        }
    });

    let mut builder = Request::builder()
        .method(Method::from_bytes(method.as_bytes())?)
        .uri(origin.request_uri(path));
    for (key, value) in prepare_headers(headers, origin) {
        builder = builder.header(key, value);
    }

    let body: OriginBody = match body {
        RequestBody::Empty => Full::new(Bytes::new()).boxed(),
        RequestBody::Full(data) => Full::new(data).boxed(),
        RequestBody::Streaming(rx) => {
            let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv()
                    .await
                    .map(|chunk| (Ok::<_, Infallible>(Frame::data(chunk)), rx))
            });
            StreamBody::new(chunks).boxed()
        }
    };

    Ok(sender.send_request(builder.body(body)?).await?)
}

/// The headers actually sent to the local origin.
///
/// Hop-by-hop headers are dropped; hyper frames the body itself, so framing
/// headers go too. `accept-encoding` is dropped so the origin replies with an
/// identity body, which is what gets re-framed onto the control channel.
/// When the dispatcher marked the original public host in
/// `x-forwarded-host`, the `host` header is rewritten to the local origin's
/// authority.
fn prepare_headers(headers: &[(String, String)], origin: &LocalOrigin) -> Vec<(String, String)> {
    let rewrite_host = headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("x-forwarded-host"));

    let mut out = Vec::with_capacity(headers.len() + 1);
    let mut has_host = false;
    for (key, value) in headers {
        match key.to_ascii_lowercase().as_str() {
            "connection" | "keep-alive" | "transfer-encoding" | "content-length"
            | "accept-encoding" => continue,
            "host" => {
                has_host = true;
                if rewrite_host {
                    out.push(("host".to_string(), origin.host.clone()));
                } else {
                    out.push((key.clone(), value.clone()));
                }
            }
            _ => out.push((key.clone(), value.clone())),
        }
    }
    if !has_host {
        out.push(("host".to_string(), origin.host.clone()));
    }
    out
}

/// Stream the origin's response back as frames.
async fn relay_response(session: &Arc<Session>, request_id: RequestId, response: Response<Incoming>) {
    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or("").to_string();
    // Bodies are re-framed decoded, so the encoding header must not survive.
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter(|(name, _)| name.as_str() != header::CONTENT_ENCODING.as_str())
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let mut body = response.into_body();
    let eof = body.is_end_stream();

    let sent = session
        .send_frame(ClientFrame::Header {
            request_id: request_id.clone(),
            status: status.as_u16(),
            status_text,
            headers,
            eof,
        })
        .await;
    if !sent || eof {
        return;
    }

    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    if data.is_empty() {
                        continue;
                    }
                    let sent = session
                        .send_frame(ClientFrame::Body {
                            request_id: request_id.clone(),
                            data: Some(ByteBuf::from(data.to_vec())),
                            eof: false,
                        })
                        .await;
                    if !sent {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                // Surface a truncated body as a premature end of stream.
                debug!("response body for {} ended early: {}", request_id, e);
                break;
            }
            None => break,
        }
    }

    let _ = session
        .send_frame(ClientFrame::Body {
            request_id,
            data: None,
            eof: true,
        })
        .await;
}

/// Check for `Upgrade: websocket` plus `Connection: upgrade` in a relayed
/// header list.
pub fn is_websocket_upgrade(headers: &[(String, String)]) -> bool {
    let field = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let has_upgrade = field("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let has_connection_upgrade = field("connection")
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);

    has_upgrade && has_connection_upgrade
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> LocalOrigin {
        LocalOrigin {
            host: "127.0.0.1:3000".to_string(),
            addr: "127.0.0.1:3000".to_string(),
            base_path: String::new(),
        }
    }

    fn pairs(input: &[(&str, &str)]) -> Vec<(String, String)> {
        input
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_host_rewritten_when_forwarded_host_present() {
        let headers = pairs(&[
            ("host", "pub.example.com"),
            ("x-forwarded-host", "pub.example.com"),
        ]);
        let out = prepare_headers(&headers, &origin());
        assert!(out.iter().any(|(k, v)| k == "host" && v == "127.0.0.1:3000"));
    }

    #[test]
    fn test_host_kept_verbatim_without_forwarded_host() {
        let headers = pairs(&[("host", "pub.example.com")]);
        let out = prepare_headers(&headers, &origin());
        assert!(out.iter().any(|(k, v)| k == "host" && v == "pub.example.com"));
    }

    #[test]
    fn test_host_added_when_missing() {
        let out = prepare_headers(&pairs(&[("accept", "*/*")]), &origin());
        assert!(out.iter().any(|(k, v)| k == "host" && v == "127.0.0.1:3000"));
    }

    #[test]
    fn test_framing_headers_are_dropped() {
        let headers = pairs(&[
            ("connection", "keep-alive"),
            ("transfer-encoding", "chunked"),
            ("content-length", "12"),
            ("accept-encoding", "gzip"),
            ("content-type", "text/plain"),
        ]);
        let out = prepare_headers(&headers, &origin());
        assert!(out.iter().any(|(k, _)| k == "content-type"));
        for dropped in [
            "connection",
            "transfer-encoding",
            "content-length",
            "accept-encoding",
        ] {
            assert!(!out.iter().any(|(k, _)| k == dropped), "{} kept", dropped);
        }
    }

    #[test]
    fn test_is_websocket_upgrade() {
        assert!(is_websocket_upgrade(&pairs(&[
            ("Upgrade", "websocket"),
            ("Connection", "keep-alive, Upgrade"),
        ])));
        assert!(!is_websocket_upgrade(&pairs(&[("Upgrade", "websocket")])));
        assert!(!is_websocket_upgrade(&pairs(&[("accept", "*/*")])));
    }
}
