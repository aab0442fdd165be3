//! Scheduler client against an in-process websocket stub.

use futures::{SinkExt, StreamExt};
use maasd::client::{SchedulerApi, SchedulerClient};
use maasd::model::Parameter;
use maasd::resource::AllocationParadigm;
use maasd::scheduler::SchedulerResponse;
use maasd::SchedulerRequest;
use serde_json::json;
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

fn request() -> SchedulerRequest {
    SchedulerRequest {
        model_name: "NWM".to_string(),
        version: 2.0,
        output: "streamflow".to_string(),
        parameters: HashMap::<String, Parameter>::new(),
        cpus: 4,
        memory: 500_000_000,
        allocation_paradigm: AllocationParadigm::SingleNode,
        config_data_id: None,
        session_secret: "secret".to_string(),
        user_id: "u1".to_string(),
    }
}

/// Serve one connection: for every request, send a progress response then a
/// final accepted response echoing the requested cpu count.
async fn stub_scheduler(listener: TcpListener, exchanges: usize) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut websocket = tokio_tungstenite::accept_async(stream).await.unwrap();

    for _ in 0..exchanges {
        let message = loop {
            match websocket.next().await.unwrap().unwrap() {
                Message::Text(text) => break text,
                Message::Close(_) => return,
                _ => continue,
            }
        };
        let request: SchedulerRequest = serde_json::from_str(message.as_str()).unwrap();

        let progress = SchedulerResponse {
            success: true,
            reason: "ALLOCATED".to_string(),
            message: format!("{} cpus allocated", request.cpus),
            job_id: "job-1".to_string(),
            data: serde_json::Value::Null,
        };
        websocket
            .send(Message::text(serde_json::to_string(&progress).unwrap()))
            .await
            .unwrap();

        let accepted =
            SchedulerResponse::accepted("job-1", json!({ "cpus": request.cpus }));
        websocket
            .send(Message::text(serde_json::to_string(&accepted).unwrap()))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn send_returns_the_final_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(stub_scheduler(listener, 1));

    let client = SchedulerClient::new(Url::parse(&format!("ws://{addr}/")).unwrap());
    let response = client.make_request(&request()).await.unwrap();

    assert!(response.success);
    assert_eq!(response.reason, "ACCEPTED");
    assert_eq!(response.job_id, "job-1");
    assert_eq!(response.data["cpus"], 4);
    server.await.unwrap();
}

#[tokio::test]
async fn streaming_surfaces_progress_responses() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(stub_scheduler(listener, 1));

    let client = SchedulerClient::new(Url::parse(&format!("ws://{addr}/")).unwrap());
    let mut progress = Vec::new();
    let response = client
        .send_streaming(&request(), |update| progress.push(update.reason.clone()))
        .await
        .unwrap();

    assert_eq!(progress, vec!["ALLOCATED".to_string()]);
    assert!(response.is_final());
    server.await.unwrap();
}

#[tokio::test]
async fn connection_is_reused_across_requests() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // The stub accepts a single connection; two exchanges on it prove reuse.
    let server = tokio::spawn(stub_scheduler(listener, 2));

    let client = SchedulerClient::new(Url::parse(&format!("ws://{addr}/")).unwrap());
    for _ in 0..2 {
        let response = client.make_request(&request()).await.unwrap();
        assert!(response.success);
    }
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_scheduler_is_a_connection_error() {
    let client = SchedulerClient::new(Url::parse("ws://127.0.0.1:1/").unwrap());
    let err = client.make_request(&request()).await.unwrap_err();
    assert!(matches!(err, maasd::client::ClientError::Connection(_)));
}
