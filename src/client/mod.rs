//! Scheduler RPC client.
//!
//! A websocket client holding one reusable connection. The connection is
//! guarded so concurrent callers queue (bounded) for the open connection
//! instead of racing to open parallel ones; a send failure drops the
//! connection and the next caller reconnects.

use crate::job::SchedulerRequest;
use crate::scheduler::SchedulerResponse;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Scheduler client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Timed out waiting for the shared connection or for a response
    #[error("scheduler client timeout: {0}")]
    Timeout(String),

    /// Could not reach the scheduler endpoint
    #[error("scheduler connection error: {0}")]
    Connection(String),

    /// The scheduler sent something unexpected
    #[error("scheduler protocol error: {0}")]
    Protocol(String),
}

/// Result type for scheduler client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// The RPC surface the request handler uses to reach the scheduler.
///
/// Implemented by [`SchedulerClient`] for separate-process deployments and
/// by test stubs.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// Submit a request and wait for the final response.
    async fn make_request(&self, request: &SchedulerRequest) -> Result<SchedulerResponse>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket RPC client for the scheduler service.
pub struct SchedulerClient {
    url: Url,
    /// The single reusable connection; locking it is the open-connection
    /// guard.
    connection: Mutex<Option<WsStream>>,
    /// How long a caller waits for the connection before giving up.
    wait_bound: Duration,
}

impl SchedulerClient {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            connection: Mutex::new(None),
            wait_bound: Duration::from_secs(30),
        }
    }

    pub fn with_wait_bound(mut self, wait_bound: Duration) -> Self {
        self.wait_bound = wait_bound;
        self
    }

    /// Submit a request, discarding progress responses, and return the final
    /// one.
    pub async fn send(&self, request: &SchedulerRequest) -> Result<SchedulerResponse> {
        self.send_streaming(request, |_| {}).await
    }

    /// Submit a request, invoking `on_update` for each progress response
    /// before the final one is returned.
    pub async fn send_streaming(
        &self,
        request: &SchedulerRequest,
        mut on_update: impl FnMut(&SchedulerResponse) + Send,
    ) -> Result<SchedulerResponse> {
        let mut guard = tokio::time::timeout(self.wait_bound, self.connection.lock())
            .await
            .map_err(|_| {
                ClientError::Timeout("waiting for the shared scheduler connection".to_string())
            })?;

        // One reconnect attempt: a stale connection from a previous exchange
        // fails fast and is replaced.
        for attempt in 0..2 {
            if guard.is_none() {
                debug!(url = %self.url, "opening scheduler connection");
                let (stream, _) = connect_async(self.url.as_str())
                    .await
                    .map_err(|err| ClientError::Connection(err.to_string()))?;
                *guard = Some(stream);
            }
            let stream = guard
                .as_mut()
                .ok_or_else(|| ClientError::Connection("connection unavailable".to_string()))?;

            match exchange(stream, request, &mut on_update).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt == 0 => {
                    warn!("scheduler exchange failed, reconnecting: {err}");
                    *guard = None;
                }
                Err(err) => {
                    *guard = None;
                    return Err(err);
                }
            }
        }
        Err(ClientError::Connection(
            "scheduler connection could not be established".to_string(),
        ))
    }
}

async fn exchange(
    stream: &mut WsStream,
    request: &SchedulerRequest,
    on_update: &mut (impl FnMut(&SchedulerResponse) + Send),
) -> Result<SchedulerResponse> {
    let payload =
        serde_json::to_string(request).map_err(|err| ClientError::Protocol(err.to_string()))?;
    stream
        .send(Message::text(payload))
        .await
        .map_err(|err| ClientError::Connection(err.to_string()))?;

    loop {
        let message = stream
            .next()
            .await
            .ok_or_else(|| ClientError::Connection("scheduler closed the connection".to_string()))?
            .map_err(|err| ClientError::Connection(err.to_string()))?;
        match message {
            Message::Text(text) => {
                let response: SchedulerResponse = serde_json::from_str(text.as_str())
                    .map_err(|err| ClientError::Protocol(err.to_string()))?;
                if response.is_final() {
                    return Ok(response);
                }
                on_update(&response);
            }
            Message::Close(_) => {
                return Err(ClientError::Connection(
                    "scheduler closed mid-exchange".to_string(),
                ));
            }
            _ => {}
        }
    }
}

#[async_trait]
impl SchedulerApi for SchedulerClient {
    async fn make_request(&self, request: &SchedulerRequest) -> Result<SchedulerResponse> {
        self.send(request).await
    }
}
