// =============================================================================
// WebSocket Handler — multiplexed event stream
// =============================================================================
//
// One long-lived connection per client. The client subscribes to topics:
//
//   { "op": "subscribe",   "topics": ["fills/sim-001", "quotes/ES"] }
//   { "op": "unsubscribe", "topics": ["quotes/ES"] }
//
// and receives envelopes `{type, topic, seq, data, ts}` in per-topic FIFO
// order. Delivery is at-least-once; clients dedupe on event_id.
//
// Slow-subscriber policy: each subscription forwards through a bounded
// per-connection channel. A client that stops reading long enough for a
// topic's broadcast buffer to lap it receives one `subscriber_lagged` error
// envelope and is disconnected; other subscribers are unaffected.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ApiContext;
use crate::clock;
use crate::events::Envelope;

/// Bound on undelivered envelopes per connection.
const CONNECTION_BUFFER: usize = 128;

#[derive(Debug, Deserialize)]
struct ClientOp {
    op: String,
    #[serde(default)]
    topics: Vec<String>,
}

/// Messages flowing from per-topic forwarders to the connection task.
enum ConnMsg {
    Event(Box<Envelope>),
    Lagged { topic: String, skipped: u64 },
}

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    info!("event stream connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
}

/// Manages one client connection: subscription bookkeeping, envelope
/// forwarding, and the lag-drop policy.
async fn handle_connection(socket: WebSocket, ctx: Arc<ApiContext>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_tx, mut conn_rx) = mpsc::channel::<ConnMsg>(CONNECTION_BUFFER);

    // Topic -> forwarder task moving bus envelopes into the connection
    // channel.
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            // ── Outbound: envelopes and lag notices ─────────────────────
            msg = conn_rx.recv() => {
                match msg {
                    Some(ConnMsg::Event(envelope)) => {
                        match serde_json::to_string(&*envelope) {
                            Ok(json) => {
                                if sender.send(Message::Text(json)).await.is_err() {
                                    debug!("event stream send failed — disconnecting");
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "envelope serialisation failed"),
                        }
                    }
                    Some(ConnMsg::Lagged { topic, skipped }) => {
                        warn!(topic = %topic, skipped, "subscriber lagged — dropping connection");
                        let diagnostic = serde_json::json!({
                            "type": "error",
                            "topic": topic,
                            "data": {
                                "code": "subscriber_lagged",
                                "skipped": skipped,
                            },
                            "ts": clock::now_ms(),
                        });
                        let _ = sender.send(Message::Text(diagnostic.to_string())).await;
                        break;
                    }
                    None => break,
                }
            }

            // ── Inbound: subscribe / unsubscribe / control frames ───────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientOp>(&text) {
                            Ok(op) if op.op == "subscribe" => {
                                for topic in op.topics {
                                    subscribe(&ctx, &mut forwarders, &conn_tx, topic);
                                }
                                send_ack(&mut sender, &forwarders).await;
                            }
                            Ok(op) if op.op == "unsubscribe" => {
                                for topic in &op.topics {
                                    if let Some(task) = forwarders.remove(topic) {
                                        task.abort();
                                        debug!(topic = %topic, "unsubscribed");
                                    }
                                }
                                send_ack(&mut sender, &forwarders).await;
                            }
                            Ok(op) => {
                                warn!(op = %op.op, "unknown stream op ignored");
                            }
                            Err(e) => {
                                debug!(error = %e, "unparseable client frame ignored");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("event stream close frame received");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Pong / binary frames need no action.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "event stream receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    for (_, task) in forwarders {
        task.abort();
    }
    info!("event stream connection closed — subscriptions released");
}

/// Attach a forwarder task for `topic` unless one already exists.
fn subscribe(
    ctx: &Arc<ApiContext>,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    conn_tx: &mpsc::Sender<ConnMsg>,
    topic: String,
) {
    if forwarders.contains_key(&topic) {
        return;
    }

    let mut rx = ctx.core.bus.subscribe(&topic);
    let tx = conn_tx.clone();
    let task_topic = topic.clone();
    let task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if tx.send(ConnMsg::Event(Box::new(envelope))).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let _ = tx
                        .send(ConnMsg::Lagged {
                            topic: task_topic.clone(),
                            skipped,
                        })
                        .await;
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    debug!(topic = %topic, "subscribed");
    forwarders.insert(topic, task);
}

async fn send_ack<S>(sender: &mut S, forwarders: &HashMap<String, JoinHandle<()>>)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let mut topics: Vec<&String> = forwarders.keys().collect();
    topics.sort();
    let ack = serde_json::json!({
        "type": "subscription_ack",
        "topic": "",
        "data": { "topics": topics },
        "ts": clock::now_ms(),
    });
    let _ = sender.send(Message::Text(ack.to_string())).await;
}
