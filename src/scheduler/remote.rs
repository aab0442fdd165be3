//! Websocket RPC endpoint for the scheduler.
//!
//! Accepts scheduler requests as JSON text frames and replies with progress
//! responses followed by a final accepted/rejected response, so the request
//! handler's scheduler client can run in a separate process.

use crate::job::SchedulerRequest;
use crate::scheduler::{Result, Scheduler, SchedulerResponse};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_native_tls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Accept scheduler RPC connections until the listener fails.
pub async fn serve_scheduler_rpc(
    scheduler: Arc<Scheduler>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        tls = tls.is_some(),
        "scheduler RPC listening"
    );
    loop {
        let (stream, peer) = listener.accept().await?;
        let scheduler = Arc::clone(&scheduler);
        let tls = tls.clone();
        tokio::spawn(async move {
            debug!(%peer, "scheduler RPC connection");
            let outcome = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => handle_connection(scheduler, tls_stream).await,
                    Err(err) => {
                        warn!(%peer, "TLS handshake failed: {err}");
                        return;
                    }
                },
                None => handle_connection(scheduler, stream).await,
            };
            if let Err(err) = outcome {
                warn!(%peer, "scheduler RPC connection ended with error: {err}");
            }
        });
    }
}

async fn handle_connection<S>(
    scheduler: Arc<Scheduler>,
    stream: S,
) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut websocket = tokio_tungstenite::accept_async(stream).await?;

    while let Some(message) = websocket.next().await {
        match message? {
            Message::Text(text) => {
                let request: SchedulerRequest = match serde_json::from_str(text.as_str()) {
                    Ok(request) => request,
                    Err(err) => {
                        debug!("unparseable scheduler request: {err}");
                        let rejection = SchedulerResponse::rejected(format!(
                            "unrecognized scheduler request: {err}"
                        ));
                        send_response(&mut websocket, &rejection).await?;
                        continue;
                    }
                };

                let (updates_tx, mut updates_rx) = mpsc::channel(8);
                let worker = {
                    let scheduler = Arc::clone(&scheduler);
                    tokio::spawn(async move {
                        scheduler
                            .handle_request_with_updates(request, Some(updates_tx))
                            .await
                    })
                };
                while let Some(update) = updates_rx.recv().await {
                    send_response(&mut websocket, &update).await?;
                }
                let response = match worker.await {
                    Ok(response) => response,
                    Err(err) => {
                        error!("scheduler worker task panicked: {err}");
                        SchedulerResponse::rejected("internal scheduler failure")
                    }
                };
                send_response(&mut websocket, &response).await?;
            }
            Message::Close(_) => break,
            // Pings are answered by the protocol layer; other frames are
            // not part of this RPC.
            _ => {}
        }
    }
    Ok(())
}

async fn send_response<S>(
    websocket: &mut tokio_tungstenite::WebSocketStream<S>,
    response: &SchedulerResponse,
) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"success":false,"reason":"REJECTED","message":"serialization failure","job_id":"-1","data":null}"#
            .to_string()
    });
    websocket.send(Message::text(payload)).await
}
