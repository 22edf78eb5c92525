//! Realtime channel protocol against a local WebSocket server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tasksync_client::{RealtimeClient, SessionContext, StreamMessage, SubscriptionSpec};
use tasksync_shared::ChangeEvent;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

const TOPIC: &str = "realtime:tasks-changes";
const TASK: &str = "7f1c8a52-2b5e-4c59-9a43-0d1f6f0c1e11";

type ServerSocket = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

async fn listen() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/realtime/v1/websocket?apikey=anon&vsn=1.0.0")).unwrap();
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Next frame that is not a heartbeat.
async fn next_frame(socket: &mut ServerSocket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(&text).unwrap();
            if frame["topic"] != "phoenix" {
                return frame;
            }
        }
    }
}

async fn send(socket: &mut ServerSocket, frame: Value) {
    socket.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn reply_join(socket: &mut ServerSocket, join: &Value, status: &str) {
    send(
        socket,
        json!({
            "topic": TOPIC,
            "event": "phx_reply",
            "ref": join["ref"],
            "join_ref": join["ref"],
            "payload": {"status": status, "response": {"reason": "invalid JWT"}}
        }),
    )
    .await;
}

async fn recv(subscription: &mut tasksync_client::Subscription) -> StreamMessage {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("message in time")
        .expect("subscription open")
}

fn ctx() -> SessionContext {
    SessionContext::new(Uuid::from_u128(42), "jwt")
}

#[tokio::test]
async fn joins_forwards_changes_and_leaves() {
    let (listener, url) = listen().await;
    let ctx = ctx();
    let mut subscription =
        RealtimeClient::with_url(url).subscribe(&ctx, SubscriptionSpec::owned_rows("tasks", &ctx));

    let mut socket = accept(&listener).await;
    let join = next_frame(&mut socket).await;
    assert_eq!(join["topic"], TOPIC);
    assert_eq!(join["event"], "phx_join");
    assert_eq!(join["payload"]["access_token"], "jwt");
    assert_eq!(
        join["payload"]["config"]["postgres_changes"][0]["filter"],
        format!("user_id=eq.{}", Uuid::from_u128(42)).as_str()
    );
    reply_join(&mut socket, &join, "ok").await;
    assert_eq!(recv(&mut subscription).await, StreamMessage::Subscribed);

    send(
        &mut socket,
        json!({
            "topic": TOPIC,
            "event": "postgres_changes",
            "ref": null,
            "payload": {"ids": [1], "data": {
                "type": "INSERT", "schema": "public", "table": "tasks",
                "commit_timestamp": "2024-03-01T09:30:00Z",
                "record": {
                    "id": TASK, "title": "water plants", "description": null,
                    "is_completed": false, "user_id": Uuid::from_u128(42),
                    "created_at": "2024-03-01T09:30:00+00:00"
                },
                "errors": null
            }}
        }),
    )
    .await;
    match recv(&mut subscription).await {
        StreamMessage::Change(ChangeEvent::Inserted(task)) => {
            assert_eq!(task.id.to_string(), TASK)
        }
        other => panic!("unexpected {other:?}"),
    }

    send(
        &mut socket,
        json!({
            "topic": TOPIC,
            "event": "postgres_changes",
            "payload": {"data": {"type": "DELETE", "record": {}, "old_record": {"id": TASK}}}
        }),
    )
    .await;
    assert_eq!(
        recv(&mut subscription).await,
        StreamMessage::Change(ChangeEvent::Deleted(Uuid::parse_str(TASK).unwrap()))
    );

    let leaving = tokio::spawn(subscription.unsubscribe());
    let leave = next_frame(&mut socket).await;
    assert_eq!(leave["event"], "phx_leave");
    assert_eq!(leave["topic"], TOPIC);
    leaving.await.unwrap();
}

#[tokio::test]
async fn rejected_join_reports_failure() {
    let (listener, url) = listen().await;
    let ctx = ctx();
    let mut subscription =
        RealtimeClient::with_url(url).subscribe(&ctx, SubscriptionSpec::owned_rows("tasks", &ctx));

    let mut socket = accept(&listener).await;
    let join = next_frame(&mut socket).await;
    reply_join(&mut socket, &join, "error").await;

    match recv(&mut subscription).await {
        StreamMessage::Failed(reason) => assert!(reason.contains("invalid JWT"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn dropped_connection_rejoins_and_reports_reconnect() {
    let (listener, url) = listen().await;
    let ctx = ctx();
    let mut subscription =
        RealtimeClient::with_url(url).subscribe(&ctx, SubscriptionSpec::owned_rows("tasks", &ctx));

    let mut socket = accept(&listener).await;
    let join = next_frame(&mut socket).await;
    reply_join(&mut socket, &join, "ok").await;
    assert_eq!(recv(&mut subscription).await, StreamMessage::Subscribed);

    drop(socket);
    assert!(matches!(recv(&mut subscription).await, StreamMessage::Failed(_)));

    let mut socket = accept(&listener).await;
    let join = next_frame(&mut socket).await;
    reply_join(&mut socket, &join, "ok").await;
    assert_eq!(recv(&mut subscription).await, StreamMessage::Reconnected);
}
