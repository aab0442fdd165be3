//! Websocket server for the request handler.
//!
//! One task per connected client. The connection's writer is fed through a
//! channel so request responses and asynchronous job updates share the
//! socket safely; acknowledgements read off the socket are fanned out to
//! whichever update streams are waiting on them. Client disconnect cancels
//! the connection's update streams but never the underlying jobs.

use crate::handler::messages::{parse_client_message, ClientMessage, UpdateAck};
use crate::handler::updates::{run_job_update_stream, UpdateStreamConfig};
use crate::handler::{HandlerError, RequestHandler, Result};
use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_native_tls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Certificate and key material for TLS listeners.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsSettings {
    /// Resolve cert/key paths from an `--ssl-dir` or explicit overrides.
    /// Returns `None` when TLS is not configured.
    pub fn resolve(
        ssl_dir: Option<&Path>,
        cert: Option<&Path>,
        key: Option<&Path>,
    ) -> Option<Self> {
        let cert = cert
            .map(Path::to_path_buf)
            .or_else(|| ssl_dir.map(|dir| dir.join("certificate.pem")))?;
        let key = key
            .map(Path::to_path_buf)
            .or_else(|| ssl_dir.map(|dir| dir.join("privkey.pem")))
            .unwrap_or_else(|| cert.with_extension("key"));
        Some(Self { cert, key })
    }
}

/// Build a TLS acceptor from PEM cert and key files.
pub fn build_tls_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor> {
    let cert = std::fs::read(&settings.cert)?;
    let key = std::fs::read(&settings.key)?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|err| HandlerError::Tls(err.to_string()))?;
    let acceptor = native_tls::TlsAcceptor::builder(identity)
        .build()
        .map_err(|err| HandlerError::Tls(err.to_string()))?;
    Ok(TlsAcceptor::from(acceptor))
}

/// Accept client connections until the listener fails.
pub async fn run_request_handler_server(
    handler: Arc<RequestHandler>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        tls = tls.is_some(),
        "request handler listening"
    );
    loop {
        let (stream, peer) = listener.accept().await?;
        let handler = Arc::clone(&handler);
        let tls = tls.clone();
        tokio::spawn(async move {
            let ip = peer.ip().to_string();
            debug!(%peer, "client connected");
            let outcome = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => handle_connection(handler, tls_stream, ip).await,
                    Err(err) => {
                        warn!(%peer, "TLS handshake failed: {err}");
                        return;
                    }
                },
                None => handle_connection(handler, stream, ip).await,
            };
            match outcome {
                Ok(()) => debug!(%peer, "client disconnected"),
                Err(err) => warn!(%peer, "connection ended with error: {err}"),
            }
        });
    }
}

async fn handle_connection<S>(
    handler: Arc<RequestHandler>,
    stream: S,
    ip_address: String,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let websocket = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = websocket.split();

    // All writes to the socket flow through one channel.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(32);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Acknowledgements fan out to every active update stream.
    let (ack_tx, _) = broadcast::channel::<UpdateAck>(32);
    let mut streams: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!("read error: {err}");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let parsed = match parse_client_message(text.as_str()) {
            Ok(parsed) => parsed,
            Err(invalid) => {
                send_json(&outbound_tx, &invalid).await;
                continue;
            }
        };

        match parsed {
            ClientMessage::UpdateAck(ack) => {
                // Routed to update streams, not dispatched.
                let _ = ack_tx.send(ack);
            }
            ClientMessage::SessionInit(message) => {
                let response = handler.handle_session_init(message, &ip_address).await;
                send_json(&outbound_tx, &response).await;
            }
            ClientMessage::ModelExec(request) => {
                let (response, job_id) = handler.handle_model_exec(request).await;
                send_json(&outbound_tx, &response).await;
                if let Some(job_id) = job_id {
                    streams.push(tokio::spawn(run_job_update_stream(
                        handler.jobs().clone(),
                        job_id,
                        outbound_tx.clone(),
                        ack_tx.subscribe(),
                        UpdateStreamConfig::default(),
                    )));
                }
            }
            ClientMessage::Update(message) => {
                let ack = handler.handle_update(message).await;
                send_json(&outbound_tx, &ack).await;
            }
            ClientMessage::JobControl(request) => {
                let response = handler.handle_job_control(request).await;
                send_json(&outbound_tx, &response).await;
            }
            ClientMessage::JobInfo(request) => {
                let response = handler.handle_job_info(request).await;
                send_json(&outbound_tx, &response).await;
            }
            ClientMessage::JobList(request) => {
                let response = handler.handle_job_list(request).await;
                send_json(&outbound_tx, &response).await;
            }
        }
    }

    // Disconnect cancels this client's update streams; the jobs themselves
    // keep running.
    for stream in streams {
        stream.abort();
    }
    drop(outbound_tx);
    let _ = writer.await;
    Ok(())
}

async fn send_json<T: serde::Serialize>(outbound: &mpsc::Sender<String>, value: &T) {
    match serde_json::to_string(value) {
        Ok(frame) => {
            let _ = outbound.send(frame).await;
        }
        Err(err) => warn!("response serialization failed: {err}"),
    }
}
