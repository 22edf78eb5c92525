//! Row-change subscription over the realtime WebSocket (Phoenix channels).
//!
//! [`RealtimeClient::subscribe`] spawns a background connection task that
//! joins a `postgres_changes` channel, keeps it alive with heartbeats and
//! reconnects with exponential backoff. Everything it learns is delivered as
//! [`StreamMessage`]s on a channel owned by the returned [`Subscription`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tasksync_shared::{ChangeEvent, ChangeKind, RowChange, RowKey, Task};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::session::SessionContext;

/// Base reconnect delay.
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// How long `unsubscribe` waits for the leave message to go out.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);
const HEARTBEAT_TOPIC: &str = "phoenix";

/// What the subscription reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// The channel was joined for the first time.
    Subscribed,
    Change(ChangeEvent),
    /// The channel was rejoined after an outage. Changes may have been missed.
    Reconnected,
    /// The connection could not be established or was lost. Retrying.
    Failed(String),
    /// The subscription ended after `unsubscribe`.
    Closed,
}

/// Which rows to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub channel: String,
    pub schema: String,
    pub table: String,
    pub filter: Option<String>,
}

impl SubscriptionSpec {
    /// Every change to the caller's own rows in `table`.
    pub fn owned_rows(table: &str, ctx: &SessionContext) -> Self {
        Self {
            channel: format!("{table}-changes"),
            schema: "public".to_string(),
            table: table.to_string(),
            filter: Some(format!("user_id=eq.{}", ctx.user_id)),
        }
    }

    fn topic(&self) -> String {
        format!("realtime:{}", self.channel)
    }

    fn join_payload(&self, access_token: &str) -> Value {
        let mut change = json!({
            "event": "*",
            "schema": self.schema,
            "table": self.table,
        });
        if let Some(filter) = &self.filter {
            change["filter"] = Value::String(filter.clone());
        }
        json!({
            "config": {
                "broadcast": {"ack": false, "self": false},
                "presence": {"key": ""},
                "postgres_changes": [change],
                "private": false,
            },
            "access_token": access_token,
        })
    }
}

/// One Phoenix channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

/// How an inbound frame affects the connection.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    Joined,
    JoinRejected(String),
    Change(ChangeEvent),
    HeartbeatAck(String),
    ChannelError(String),
    Ignored,
}

pub(crate) fn classify(frame: Frame, topic: &str, join_ref: &str) -> Inbound {
    if frame.topic == HEARTBEAT_TOPIC {
        return match (frame.event.as_str(), frame.reference) {
            ("phx_reply", Some(reference)) => Inbound::HeartbeatAck(reference),
            _ => Inbound::Ignored,
        };
    }
    if frame.topic != topic {
        return Inbound::Ignored;
    }
    match frame.event.as_str() {
        "phx_reply" if frame.reference.as_deref() == Some(join_ref) => {
            match frame.payload["status"].as_str() {
                Some("ok") => Inbound::Joined,
                _ => Inbound::JoinRejected(reason(&frame.payload["response"])),
            }
        }
        "postgres_changes" => match decode_change(&frame.payload) {
            Ok(event) => Inbound::Change(event),
            Err(e) => {
                warn!("skipping undecodable change: {e}");
                Inbound::Ignored
            }
        },
        "system" if frame.payload["status"].as_str() == Some("error") => {
            Inbound::ChannelError(reason(&frame.payload))
        }
        "phx_error" => Inbound::ChannelError("channel error".into()),
        "phx_close" => Inbound::ChannelError("channel closed by server".into()),
        _ => Inbound::Ignored,
    }
}

fn reason(payload: &Value) -> String {
    ["reason", "message"]
        .iter()
        .find_map(|key| payload[*key].as_str())
        .unwrap_or("rejected")
        .to_string()
}

/// Decodes a `postgres_changes` payload into a change event.
///
/// Deletes carry an empty `record` and only the key in `old_record`, so each
/// side is decoded only where the change kind needs it.
pub(crate) fn decode_change(payload: &Value) -> std::result::Result<ChangeEvent, String> {
    let data = &payload["data"];
    let kind: ChangeKind =
        serde_json::from_value(data["type"].clone()).map_err(|e| format!("change type: {e}"))?;
    let new = match kind {
        ChangeKind::Insert | ChangeKind::Update => Some(
            serde_json::from_value::<Task>(data["record"].clone())
                .map_err(|e| format!("record: {e}"))?,
        ),
        ChangeKind::Delete => None,
    };
    let old = serde_json::from_value::<RowKey>(data["old_record"].clone()).ok();
    ChangeEvent::try_from(RowChange { kind, new, old }).map_err(|e| e.to_string())
}

pub struct RealtimeClient {
    url: Url,
    heartbeat: Duration,
    max_reconnect_delay: Duration,
}

impl RealtimeClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            url: config.realtime_url()?,
            heartbeat: config.realtime.heartbeat_interval(),
            max_reconnect_delay: config.realtime.max_reconnect_delay(),
        })
    }

    pub fn with_url(url: Url) -> Self {
        let defaults = crate::config::RealtimeConfig::default();
        Self {
            url,
            heartbeat: defaults.heartbeat_interval(),
            max_reconnect_delay: defaults.max_reconnect_delay(),
        }
    }

    /// Opens a subscription. Must be called inside a tokio runtime.
    pub fn subscribe(&self, ctx: &SessionContext, spec: SubscriptionSpec) -> Subscription {
        let (events, messages) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let connection = Connection {
            url: self.url.to_string(),
            access_token: ctx.access_token.clone(),
            spec,
            heartbeat: self.heartbeat,
            max_reconnect_delay: self.max_reconnect_delay,
            events,
            next_ref: 0,
        };
        let task = tokio::spawn(connection.run(shutdown_rx));
        Subscription {
            messages,
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// A live subscription. Dropping it tears the connection down.
pub struct Subscription {
    messages: mpsc::UnboundedReceiver<StreamMessage>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.messages.recv().await
    }

    /// Leaves the channel and closes the socket.
    pub async fn unsubscribe(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(LEAVE_TIMEOUT, &mut self.task)
            .await
            .is_err()
        {
            debug!("realtime task did not stop in time, aborting");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Exit {
    Shutdown,
    OwnerGone,
}

struct Connection {
    url: String,
    access_token: String,
    spec: SubscriptionSpec,
    heartbeat: Duration,
    max_reconnect_delay: Duration,
    events: mpsc::UnboundedSender<StreamMessage>,
    next_ref: u64,
}

impl Connection {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut attempt: u32 = 0;
        let mut joined_before = false;
        let mut outage_reported = false;

        loop {
            let mut joined = false;
            let outcome = self
                .connect_once(&mut shutdown, &mut joined, joined_before)
                .await;
            if joined {
                joined_before = true;
                outage_reported = false;
                attempt = 0;
            }
            match outcome {
                Ok(Exit::Shutdown) => {
                    let _ = self.events.send(StreamMessage::Closed);
                    return;
                }
                Ok(Exit::OwnerGone) => return,
                Err(e) => {
                    warn!("realtime connection failed (attempt {attempt}): {e}");
                    if !outage_reported {
                        outage_reported = true;
                        if self.events.send(StreamMessage::Failed(e)).is_err() {
                            return;
                        }
                    }
                    let delay = reconnect_delay(attempt, self.max_reconnect_delay);
                    attempt += 1;
                    tokio::select! {
                        _ = &mut shutdown => {
                            let _ = self.events.send(StreamMessage::Closed);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    /// One connection lifetime. `Err` means the connection failed or dropped.
    async fn connect_once(
        &mut self,
        shutdown: &mut oneshot::Receiver<()>,
        joined: &mut bool,
        rejoin: bool,
    ) -> std::result::Result<Exit, String> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| format!("connect: {e}"))?;
        let (mut write, mut read) = socket.split();

        let topic = self.spec.topic();
        let join_ref = self.make_ref();
        let join = Frame {
            topic: topic.clone(),
            event: "phx_join".into(),
            payload: self.spec.join_payload(&self.access_token),
            reference: Some(join_ref.clone()),
            join_ref: Some(join_ref.clone()),
        };
        send_frame(&mut write, &join).await?;
        debug!("joining {topic}");

        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        let mut pending_heartbeat: Option<String> = None;

        loop {
            tokio::select! {
                _ = &mut *shutdown => {
                    let leave = Frame {
                        topic: topic.clone(),
                        event: "phx_leave".into(),
                        payload: json!({}),
                        reference: Some(self.make_ref()),
                        join_ref: Some(join_ref.clone()),
                    };
                    if let Err(e) = send_frame(&mut write, &leave).await {
                        debug!("leave not delivered: {e}");
                    }
                    let _ = write.close().await;
                    info!("left {topic}");
                    return Ok(Exit::Shutdown);
                }
                _ = heartbeat.tick() => {
                    if pending_heartbeat.is_some() {
                        return Err("heartbeat timed out".into());
                    }
                    let reference = self.make_ref();
                    let beat = Frame {
                        topic: HEARTBEAT_TOPIC.into(),
                        event: "heartbeat".into(),
                        payload: json!({}),
                        reference: Some(reference.clone()),
                        join_ref: None,
                    };
                    send_frame(&mut write, &beat).await?;
                    pending_heartbeat = Some(reference);
                }
                incoming = read.next() => {
                    let text = match incoming {
                        None => return Err("connection closed".into()),
                        Some(Err(e)) => return Err(format!("read: {e}")),
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) => return Err("closed by server".into()),
                        Some(Ok(_)) => continue,
                    };
                    let frame: Frame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("ignoring malformed frame: {e}");
                            continue;
                        }
                    };
                    let forward = match classify(frame, &topic, &join_ref) {
                        Inbound::Joined => {
                            *joined = true;
                            info!("subscribed to {topic}");
                            if rejoin { StreamMessage::Reconnected } else { StreamMessage::Subscribed }
                        }
                        Inbound::JoinRejected(reason) => {
                            return Err(format!("join rejected: {reason}"));
                        }
                        Inbound::ChannelError(reason) => return Err(reason),
                        Inbound::HeartbeatAck(reference) => {
                            if pending_heartbeat.as_deref() == Some(reference.as_str()) {
                                pending_heartbeat = None;
                            }
                            continue;
                        }
                        Inbound::Change(event) => {
                            trace!("change for {}", event.task_id());
                            StreamMessage::Change(event)
                        }
                        Inbound::Ignored => continue,
                    };
                    if self.events.send(forward).is_err() {
                        return Ok(Exit::OwnerGone);
                    }
                }
            }
        }
    }
}

/// 1s, 2s, 4s, ... for consecutive failed attempts, capped at `max`.
fn reconnect_delay(attempt: u32, max: Duration) -> Duration {
    BASE_RECONNECT_DELAY
        .saturating_mul(2u32.saturating_pow(attempt.min(5)))
        .min(max)
}

async fn send_frame<S>(write: &mut S, frame: &Frame) -> std::result::Result<(), String>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame).map_err(|e| format!("encode: {e}"))?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| format!("send: {e}"))
}
