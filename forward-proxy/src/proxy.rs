use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use anyhow::Error;
use http::{
    HeaderMap, HeaderValue, Method, Request, Response, header,
    uri::{Authority, PathAndQuery},
};
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::{net::TcpStream, time::timeout};
use tokio_stream::StreamExt;

use crate::{Outgoing, full_body, text_response, tunnel};

/// Connection-scoped headers that must not be forwarded by an intermediary.
static HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Appends the client address to `X-Forwarded-For`, extending any value an
/// earlier hop already set.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let value = match headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        Some(prior) => format!("{prior}, {client}"),
        None => client.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Target authority and origin-form path of a proxied request: taken from the
/// absolute-form URI when present, otherwise resolved against `Host`.
pub fn resolve_target(
    uri: &http::Uri,
    headers: &HeaderMap,
) -> Option<(Authority, PathAndQuery)> {
    let path_and_query = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    if let Some(authority) = uri.authority() {
        return Some((authority.clone(), path_and_query));
    }
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let authority = host.parse::<Authority>().ok()?;
    Some((authority, path_and_query))
}

#[derive(Clone, Copy, Debug)]
pub struct ProxyConfig {
    /// Bound on establishing upstream TCP connections.
    pub connect_timeout: Duration,
    /// Log request lifecycle: method, target, duration, tunnel events.
    pub verbose: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            verbose: false,
        }
    }
}

/// Forwarding proxy: relays plain HTTP requests and CONNECT tunnels without
/// altering message boundaries. Holds no state across requests.
pub struct Proxy {
    pub(crate) config: ProxyConfig,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client: SocketAddr,
    ) -> Result<Response<Outgoing>, Error> {
        let started = Instant::now();
        let method = req.method().clone();
        let target = req.uri().to_string();

        let res = if method == Method::CONNECT {
            tunnel::establish(&self.config, req).await
        } else {
            self.forward(req, client).await
        };

        if self.config.verbose {
            log::info!("[{method}] {target} ({:?})", started.elapsed());
        }
        res
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        client: SocketAddr,
    ) -> Result<Response<Outgoing>, Error> {
        let (parts, body) = req.into_parts();
        let Some((authority, path_and_query)) = resolve_target(&parts.uri, &parts.headers) else {
            return text_response(400, "Cannot determine request target");
        };

        let mut headers = parts.headers.clone();
        let original_host = headers.get(header::HOST).cloned();
        strip_hop_by_hop(&mut headers);
        append_forwarded_for(&mut headers, client.ip());
        if let Some(host) = original_host {
            headers.insert("x-forwarded-host", host);
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        headers.insert(header::HOST, HeaderValue::from_str(authority.as_str())?);

        let mut out = Request::builder()
            .method(parts.method.clone())
            .uri(path_and_query.as_str())
            .body(body)?;
        *out.headers_mut() = headers;

        let addr = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::error!("Cannot connect to {addr}: {e}");
                return text_response(502, format!("Cannot connect to {addr}: {e}"));
            }
            Err(_) => {
                log::error!("Connection to {addr} timed out");
                return text_response(502, format!("Connection to {addr} timed out"));
            }
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        log::debug!("Outgoing connection to {addr} established");
        tokio::task::spawn({
            let addr = addr.clone();
            async move {
                if let Err(err) = conn.await {
                    log::error!("Outgoing connection to {addr} failed: {err:?}");
                } else {
                    log::debug!("Outgoing connection to {addr} closed");
                }
            }
        });

        // Redirects are relayed as-is: the manual client never follows them.
        let res = match sender.send_request(out).await {
            Ok(res) => res,
            Err(e) => {
                log::error!("Upstream request to {addr} failed: {e}");
                return text_response(502, format!("Upstream request failed: {e}"));
            }
        };

        let (mut parts, body) = res.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let streaming = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("text/event-stream"));

        let body = if streaming {
            // Relay frame by frame: buffering an event stream would coalesce
            // every event behind a single flush.
            StreamBody::new(BodyStream::new(body).map(|frame| frame.map_err(Error::from))).boxed()
        } else {
            full_body(body.collect().await?.to_bytes())
        };
        Ok(Response::from_parts(parts, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn forwarded_for_is_appended() {
        let client: IpAddr = "10.0.0.2".parse().unwrap();

        let mut fresh = HeaderMap::new();
        append_forwarded_for(&mut fresh, client);
        assert_eq!(fresh.get("x-forwarded-for").unwrap(), "10.0.0.2");

        let mut prior = HeaderMap::new();
        prior.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1"));
        append_forwarded_for(&mut prior, client);
        assert_eq!(
            prior.get("x-forwarded-for").unwrap(),
            "192.168.1.1, 10.0.0.2"
        );
    }

    #[test]
    fn target_resolution() {
        let absolute: http::Uri = "http://example.com:8080/path?q=1".parse().unwrap();
        let (authority, pq) = resolve_target(&absolute, &HeaderMap::new()).unwrap();
        assert_eq!(authority.as_str(), "example.com:8080");
        assert_eq!(pq.as_str(), "/path?q=1");

        let origin: http::Uri = "/path".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        let (authority, pq) = resolve_target(&origin, &headers).unwrap();
        assert_eq!(authority.as_str(), "example.com");
        assert_eq!(pq.as_str(), "/path");

        assert!(resolve_target(&origin, &HeaderMap::new()).is_none());
    }

    async fn spawn_upstream() -> (SocketAddr, Arc<Mutex<Option<HeaderMap>>>) {
        use hyper::{server::conn::http1, service::service_fn};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        tokio::task::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let captured = captured.clone();
                tokio::task::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let captured = captured.clone();
                        async move {
                            *captured.lock().unwrap() = Some(req.headers().clone());
                            Ok::<_, Error>(
                                Response::builder()
                                    .header("proxy-authenticate", "Basic realm=test")
                                    .header("x-upstream", "yes")
                                    .body(full_body("upstream says hi"))?,
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, seen)
    }

    #[tokio::test]
    async fn forward_relays_and_scrubs_headers() {
        let (upstream, seen) = spawn_upstream().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::task::spawn(crate::serve_listener(
            listener,
            Arc::new(Proxy::new(ProxyConfig::default())),
        ));

        let request = format!(
            "GET http://{upstream}/hello HTTP/1.1\r\nHost: {upstream}\r\n\
             Connection: close\r\nKeep-Alive: timeout=5\r\n\r\n"
        );
        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();

        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.ends_with("upstream says hi"));
        assert!(text.contains("x-upstream: yes"));
        // Hop-by-hop response headers must not survive the relay.
        assert!(!text.contains("proxy-authenticate"));

        let headers = seen.lock().unwrap().clone().unwrap();
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "127.0.0.1");
        assert_eq!(
            headers.get("x-forwarded-host").unwrap(),
            upstream.to_string().as_str()
        );
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        // Hop-by-hop request headers are scrubbed before forwarding.
        assert!(!headers.contains_key("keep-alive"));
    }

    async fn spawn_sse_upstream() -> SocketAddr {
        use hyper::{
            body::{Bytes, Frame},
            server::conn::http1,
            service::service_fn,
        };
        use tokio_stream::wrappers::ReceiverStream;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::task::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::task::spawn(async move {
                    let service = service_fn(|_req: Request<Incoming>| async {
                        let (tx, rx) = tokio::sync::mpsc::channel(4);
                        tokio::task::spawn(async move {
                            tx.send(Ok::<_, Error>(Frame::data(Bytes::from("data: one\n\n"))))
                                .await
                                .unwrap();
                            // Hold the second event back so a buffering relay
                            // would be caught waiting for it.
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            tx.send(Ok::<_, Error>(Frame::data(Bytes::from("data: two\n\n"))))
                                .await
                                .unwrap();
                        });
                        Ok::<_, Error>(
                            Response::builder()
                                .header(header::CONTENT_TYPE, "text/event-stream")
                                .body(StreamBody::new(ReceiverStream::new(rx)).boxed())?,
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn event_stream_deliveries_stay_distinct() {
        let upstream = spawn_sse_upstream().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::task::spawn(crate::serve_listener(
            listener,
            Arc::new(Proxy::new(ProxyConfig::default())),
        ));

        let request = format!(
            "GET http://{upstream}/events HTTP/1.1\r\nHost: {upstream}\r\n\
             Connection: close\r\n\r\n"
        );
        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        // Read until the first event shows up, without waiting for the body
        // to end.
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !String::from_utf8_lossy(&buf).contains("data: one\n\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "stream ended before the first event");
            buf.extend_from_slice(&chunk[..n]);
        }
        let head = String::from_utf8_lossy(&buf).into_owned();
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
        assert!(head.contains("content-type: text/event-stream"));
        // The upstream is still holding the second event, so its presence
        // here would mean the relay collected the body before responding.
        assert!(!head.contains("data: two"));

        stream.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("data: two\n\n"));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::task::spawn(crate::serve_listener(
            listener,
            Arc::new(Proxy::new(ProxyConfig::default())),
        ));

        // Port 1 on localhost refuses connections.
        let request = "GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\
                       Connection: close\r\n\r\n";
        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 502"));
    }
}
