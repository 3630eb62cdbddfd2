use anyhow::Error;
use http::{Request, Response};
use hyper::{
    body::Incoming,
    upgrade::{OnUpgrade, Upgraded},
};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpStream, time::timeout};

use crate::{Outgoing, empty_body, proxy::ProxyConfig, text_response};

/// Handles a CONNECT request: dials the target authority, takes over the
/// client connection, and relays bytes opaquely in both directions.
pub(crate) async fn establish(
    config: &ProxyConfig,
    mut req: Request<Incoming>,
) -> Result<Response<Outgoing>, Error> {
    let Some(authority) = req.uri().authority().cloned() else {
        return text_response(400, "CONNECT target must be authority-form");
    };
    let addr = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(443));

    let target = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            log::error!("Cannot open tunnel to {addr}: {e}");
            return text_response(503, format!("Cannot open tunnel to {addr}: {e}"));
        }
        Err(_) => {
            log::error!("Tunnel connection to {addr} timed out");
            return text_response(503, format!("Tunnel connection to {addr} timed out"));
        }
    };

    // Capability check: without connection takeover the tunnel cannot be
    // emulated, so fail fast.
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        log::error!("Transport does not support connection takeover");
        return text_response(500, "Connection takeover not supported");
    };

    let verbose = config.verbose;
    if verbose {
        log::info!("Tunnel to {addr} established");
    }
    tokio::task::spawn(async move {
        match on_upgrade.await {
            Ok(client) => {
                if let Err(e) = run(client, target).await {
                    log::debug!("Tunnel to {addr} errored: {e}");
                }
                if verbose {
                    log::info!("Tunnel to {addr} closed");
                }
            }
            Err(e) => log::error!("Connection takeover failed: {e}"),
        }
    });

    // The 200 status line is written by the server machinery, after which the
    // connection is handed over to the copy task above.
    Ok(Response::builder().status(200).body(empty_body())?)
}

/// Copies bytes concurrently in both directions until either side reaches
/// end-of-stream, then tears the whole tunnel down. The payload is opaque and
/// never inspected.
async fn run(client: Upgraded, mut target: TcpStream) -> std::io::Result<()> {
    let client = TokioIo::new(client);
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut target_rd, mut target_wr) = target.split();
    tokio::select! {
        res = tokio::io::copy(&mut client_rd, &mut target_wr) => { res?; }
        res = tokio::io::copy(&mut target_rd, &mut client_wr) => { res?; }
    }
    Ok(())
}
