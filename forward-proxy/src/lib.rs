pub mod proxy;
pub mod tunnel;

pub use self::proxy::{Proxy, ProxyConfig};

use std::sync::Arc;

use anyhow::Error;
use http::{Response, header};
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::{body::Bytes, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, ToSocketAddrs};

pub type Outgoing = BoxBody<Bytes, Error>;

pub fn empty_body() -> Outgoing {
    Empty::new().map_err(Error::new).boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> Outgoing {
    Full::new(data.into()).map_err(Error::new).boxed()
}

/// Plain-text error reply, used for upstream and capability failures.
pub fn text_response(status: u16, message: impl Into<String>) -> Result<Response<Outgoing>, Error> {
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message.into()))?)
}

pub async fn serve<A: ToSocketAddrs>(addr: A, proxy: Arc<Proxy>) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    log::info!(
        "Listening for incoming connections at {}",
        listener.local_addr()?
    );
    serve_listener(listener, proxy).await
}

/// Accept loop: one task per connection. Connections are served with upgrade
/// support so that CONNECT can take over the raw byte stream.
pub async fn serve_listener(listener: TcpListener, proxy: Arc<Proxy>) -> Result<(), Error> {
    loop {
        let (stream, addr) = listener.accept().await?;
        log::debug!("Incoming connection from {addr} established");

        let io = TokioIo::new(stream);
        let proxy = proxy.clone();

        tokio::task::spawn(async move {
            let service = service_fn({
                let proxy = proxy.clone();
                move |req| {
                    let proxy = proxy.clone();
                    async move { proxy.handle(req, addr).await }
                }
            });
            let conn = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades();
            if let Err(err) = conn.await {
                log::error!("Incoming connection from {addr} failed: {err:?}");
            } else {
                log::debug!("Incoming connection closed: {addr}");
            }
        });
    }
}
