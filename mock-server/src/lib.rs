pub mod api;
pub mod catalog;
pub mod endpoint;
pub mod error;
pub mod service;
pub mod stream;
pub mod synth;

pub use self::{
    endpoint::{Api, ApiConfig},
    service::{Outgoing, Service},
    synth::Synthesizer,
};

use std::sync::Arc;

use anyhow::Error;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, ToSocketAddrs};

pub async fn serve<A, S>(addr: A, service: Arc<S>) -> Result<(), Error>
where
    A: ToSocketAddrs,
    S: Service + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    log::info!(
        "Listening for incoming connections at {}",
        listener.local_addr()?
    );
    serve_listener(listener, service).await
}

/// Accept loop: one task per connection, requests served over HTTP/1.
pub async fn serve_listener<S: Service + 'static>(
    listener: TcpListener,
    service: Arc<S>,
) -> Result<(), Error> {
    loop {
        let (stream, addr) = listener.accept().await?;
        log::debug!("Incoming connection from {addr} established");

        let io = TokioIo::new(stream);
        let service = service.clone();

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(
                    io,
                    service_fn({
                        let service = service.clone();
                        move |req| service.clone().call_arc(req)
                    }),
                )
                .await
            {
                if err.is_incomplete_message() {
                    log::warn!("Incoming connection from {addr} unexpected EOF");
                } else {
                    log::error!("Incoming connection from {addr} failed: {err:?}");
                }
            } else {
                log::debug!("Incoming connection closed: {addr}");
            }
        });
    }
}
