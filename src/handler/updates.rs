//! Per-client job update streams.
//!
//! After an accepted submission the connection spawns one of these tasks per
//! job: it re-reads the job on an adaptive interval (fast at first, backing
//! off to a slow steady state), publishes an UPDATE for every observed
//! status change, and waits for the client's acknowledgement before the next
//! poll. The job's status channel is watched as well, so a change published
//! by the job manager wakes the poll early. The stream ends when the job
//! leaves the active set or the client goes away.

use crate::handler::messages::{UpdateAck, UpdateMessage};
use crate::job::JobManager;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Pacing for the update stream.
#[derive(Debug, Clone)]
pub struct UpdateStreamConfig {
    /// Poll interval for the first few iterations.
    pub initial_interval: Duration,
    /// Number of fast iterations before backing off.
    pub fast_iterations: u32,
    /// Ceiling for the backed-off interval.
    pub max_interval: Duration,
    /// How long to wait for the client's acknowledgement.
    pub ack_timeout: Duration,
}

impl Default for UpdateStreamConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            fast_iterations: 8,
            max_interval: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(30),
        }
    }
}

/// Stream status changes of one job to one client.
///
/// `outbound` carries serialized frames to the connection's writer;
/// `acks` receives every acknowledgement the client sends on the
/// connection, from which this stream picks out its own digests.
pub async fn run_job_update_stream(
    jobs: JobManager,
    job_id: String,
    outbound: mpsc::Sender<String>,
    mut acks: broadcast::Receiver<UpdateAck>,
    config: UpdateStreamConfig,
) {
    let mut status_events = match jobs.subscribe_status(&job_id).await {
        Ok(subscription) => Some(subscription),
        Err(err) => {
            debug!(job_id = %job_id, "status channel unavailable, polling only: {err}");
            None
        }
    };

    let mut interval = config.initial_interval;
    let mut iteration: u32 = 0;
    let mut sequence: u64 = 0;
    let mut last_sent: Option<String> = None;

    loop {
        // Sleep until the next poll, or earlier if the job manager
        // publishes a change.
        let mut channel_gone = false;
        match &mut status_events {
            Some(subscription) => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    event = subscription.next_message() => {
                        channel_gone = event.is_none();
                    }
                }
            }
            None => tokio::time::sleep(interval).await,
        }
        if channel_gone {
            status_events = None;
        }

        iteration += 1;
        if iteration > config.fast_iterations && interval < config.max_interval {
            interval = (interval * 2).min(config.max_interval);
        }

        let job = match jobs.retrieve(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %job_id, "job disappeared, ending update stream");
                return;
            }
            Err(err) => {
                warn!(job_id = %job_id, "job read failed in update stream: {err}");
                continue;
            }
        };

        let status = job.status.to_string();
        if last_sent.as_deref() != Some(&status) {
            sequence += 1;
            let digest = update_digest(&job_id, &status, sequence);
            let update = UpdateMessage {
                object_type: "Job".to_string(),
                object_id: job_id.clone(),
                updated_data: HashMap::from([("status".to_string(), status.clone())]),
                digest: digest.clone(),
            };
            let frame = update.to_wire().to_string();
            if outbound.send(frame).await.is_err() {
                debug!(job_id = %job_id, "client gone, ending update stream");
                return;
            }
            await_ack(&mut acks, &digest, config.ack_timeout, &job_id).await;
            last_sent = Some(status);
        }

        if !job.is_active() {
            debug!(job_id = %job_id, "job left the active set, ending update stream");
            return;
        }
    }
}

/// Wait for the acknowledgement matching `digest`. Mismatched digests are
/// logged and skipped; a timeout is logged and the stream proceeds.
async fn await_ack(
    acks: &mut broadcast::Receiver<UpdateAck>,
    digest: &str,
    timeout: Duration,
    job_id: &str,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            warn!(job_id = %job_id, "no acknowledgement for update {digest}");
            return;
        }
        match tokio::time::timeout(remaining, acks.recv()).await {
            Ok(Ok(ack)) => {
                if ack.digest == digest {
                    return;
                }
                warn!(
                    job_id,
                    expected = digest,
                    received = %ack.digest,
                    "acknowledgement digest mismatch"
                );
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                warn!(job_id = %job_id, skipped, "acknowledgement stream lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => return,
            Err(_) => {
                warn!(job_id = %job_id, "no acknowledgement for update {digest}");
                return;
            }
        }
    }
}

/// Opaque token correlating one update with its acknowledgement.
fn update_digest(job_id: &str, status: &str, sequence: u64) -> String {
    hex::encode(Sha256::digest(format!("{job_id}:{status}:{sequence}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digests_are_unique_per_sequence() {
        let a = update_digest("j1", "RUNNING_DEFAULT", 1);
        let b = update_digest("j1", "RUNNING_DEFAULT", 2);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
