//! NIP-01 WebSocket endpoint.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::Event;
use crate::filter::Filter;
use crate::hub::{ConnectionId, Outbound, SLOW_CONSUMER};
use crate::relay::Relay;

/// Longest subscription id accepted from clients.
const MAX_SUB_ID: usize = 64;

/// Start a WebSocket server speaking NIP-01 (EVENT, REQ, CLOSE, COUNT).
pub async fn serve_ws(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "websocket listening");
    axum::serve(listener, router(relay).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new().route("/", get(handler)).with_state(relay)
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move { process(socket, relay).await })
}

/// Read client messages; a separate task drains the outbound queue.
async fn process(socket: WebSocket, relay: Arc<Relay>) {
    let conn = relay.hub().connect();
    let id = conn.id;
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, conn.rx, relay.clone(), id));

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(txt) => {
                if handle_text(&relay, id, &conn.tx, &txt).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    relay.hub().disconnect(id);
    writer.abort();
}

/// Forward queued messages, skipping deliveries for closed subscriptions.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    relay: Arc<Relay>,
    conn: ConnectionId,
) {
    while let Some(out) = rx.recv().await {
        let current = match &out {
            Outbound::Event { sub_id, generation, .. } | Outbound::Eose { sub_id, generation } => {
                relay.hub().is_current(conn, sub_id, *generation)
            }
            _ => true,
        };
        if current && sink.send(Message::Text(encode(&out).to_string())).await.is_err() {
            break;
        }
        for sub_id in relay.hub().take_dropped(conn) {
            let closed = Outbound::Closed {
                sub_id,
                reason: SLOW_CONSUMER.into(),
            };
            if sink.send(Message::Text(encode(&closed).to_string())).await.is_err() {
                return;
            }
        }
    }
}

/// Relay-to-client wire form.
fn encode(out: &Outbound) -> Value {
    match out {
        Outbound::Event { sub_id, event, .. } => json!(["EVENT", sub_id, event.as_ref()]),
        Outbound::Eose { sub_id, .. } => json!(["EOSE", sub_id]),
        Outbound::Closed { sub_id, reason } => json!(["CLOSED", sub_id, reason]),
        Outbound::Ok {
            event_id,
            accepted,
            message,
        } => json!(["OK", event_id, accepted, message]),
        Outbound::Count { sub_id, count } => json!(["COUNT", sub_id, {"count": count}]),
        Outbound::Notice(msg) => json!(["NOTICE", msg]),
    }
}

/// Dispatch one client frame. `Err` means the connection is gone.
async fn handle_text(
    relay: &Relay,
    conn: ConnectionId,
    tx: &mpsc::Sender<Outbound>,
    txt: &str,
) -> std::result::Result<(), mpsc::error::SendError<Outbound>> {
    let val: Value = match serde_json::from_str(txt) {
        Ok(v) => v,
        Err(_) => return tx.send(notice("invalid: message is not JSON")).await,
    };
    let Some(arr) = val.as_array() else {
        return tx.send(notice("invalid: message must be a JSON array")).await;
    };
    match arr.first().and_then(Value::as_str) {
        Some("EVENT") => {
            let Some(raw) = arr.get(1) else {
                return tx.send(notice("invalid: EVENT without event")).await;
            };
            let reply = match serde_json::from_value::<Event>(raw.clone()) {
                Ok(ev) => {
                    let event_id = ev.id.clone();
                    match relay.publish(ev).await {
                        Ok(done) => Outbound::Ok {
                            event_id,
                            accepted: true,
                            message: done.message().into(),
                        },
                        Err(e) => {
                            if e.is_transient() {
                                warn!(conn, id = %event_id, error = %e, "event not stored");
                            }
                            Outbound::Ok {
                                event_id,
                                accepted: false,
                                message: e.to_string(),
                            }
                        }
                    }
                }
                Err(e) => match raw.get("id").and_then(Value::as_str) {
                    Some(id) => Outbound::Ok {
                        event_id: id.to_string(),
                        accepted: false,
                        message: format!("invalid: {e}"),
                    },
                    None => notice(format!("invalid: {e}")),
                },
            };
            tx.send(reply).await
        }
        Some(verb @ ("REQ" | "COUNT")) => {
            let Some(sub_id) = arr.get(1).and_then(Value::as_str) else {
                return tx.send(notice("invalid: missing subscription id")).await;
            };
            if sub_id.is_empty() || sub_id.len() > MAX_SUB_ID {
                return tx.send(closed(sub_id, "invalid: bad subscription id")).await;
            }
            let filters = match parse_filters(&arr[2..]) {
                Ok(f) => f,
                Err(e) => return tx.send(closed(sub_id, e.to_string())).await,
            };
            if verb == "COUNT" {
                let reply = match relay.count(&filters) {
                    Ok(count) => Outbound::Count {
                        sub_id: sub_id.to_string(),
                        count,
                    },
                    Err(e) => closed(sub_id, e.to_string()),
                };
                return tx.send(reply).await;
            }
            debug!(conn, sub = sub_id, filters = filters.len(), "subscribe");
            match relay.subscribe(conn, tx, sub_id, filters).await {
                Ok(()) => Ok(()),
                Err(e) => tx.send(closed(sub_id, e.to_string())).await,
            }
        }
        Some("CLOSE") => {
            if let Some(sub_id) = arr.get(1).and_then(Value::as_str) {
                relay.hub().unregister(conn, sub_id);
            }
            Ok(())
        }
        _ => tx.send(notice("invalid: unknown message type")).await,
    }
}

fn parse_filters(raw: &[Value]) -> crate::error::Result<Vec<Filter>> {
    raw.iter().map(Filter::from_value).collect()
}

fn notice(msg: impl Into<String>) -> Outbound {
    Outbound::Notice(msg.into())
}

fn closed(sub_id: &str, reason: impl Into<String>) -> Outbound {
    Outbound::Closed {
        sub_id: sub_id.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testing::{group_event, keys};
    use crate::event::{Keys, Tag};
    use crate::relay::testing::relay;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{tungstenite::protocol::Message as TungMessage, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(relay: Arc<Relay>) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = axum::serve(listener, router(relay).into_make_service());
        let handle = tokio::spawn(async move {
            server.await.unwrap();
        });
        (format!("ws://{}/", addr), handle)
    }

    async fn send(ws: &mut Client, val: Value) {
        ws.send(TungMessage::Text(val.to_string())).await.unwrap();
    }

    async fn next_json(ws: &mut Client) -> Value {
        loop {
            if let TungMessage::Text(t) = ws.next().await.unwrap().unwrap() {
                return serde_json::from_str(&t).unwrap();
            }
        }
    }

    /// Collect event ids until EOSE for `sub`.
    async fn until_eose(ws: &mut Client, sub: &str) -> Vec<String> {
        let mut ids = vec![];
        loop {
            let v = next_json(ws).await;
            match v[0].as_str() {
                Some("EVENT") if v[1] == sub => ids.push(v[2]["id"].as_str().unwrap().to_string()),
                Some("EOSE") if v[1] == sub => return ids,
                _ => {}
            }
        }
    }

    async fn publish(ws: &mut Client, ev: &Event) -> Value {
        send(ws, json!(["EVENT", ev])).await;
        loop {
            let v = next_json(ws).await;
            if v[0] == "OK" && v[1] == ev.id.as_str() {
                return v;
            }
        }
    }

    fn now() -> u64 {
        crate::relay::unix_now()
    }

    async fn lounge(ws: &mut Client, owner: &Keys) {
        let create = group_event(owner, 9007, now() - 100, "lounge", vec![]);
        assert_eq!(publish(ws, &create).await[2], true);
    }

    #[tokio::test]
    async fn ws_event_ok_and_req_round_trip() {
        let (url, handle) = start(Arc::new(relay())).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let owner = keys(1);
        lounge(&mut ws, &owner).await;
        let msg = group_event(&owner, 9, now() - 50, "lounge", vec![]);
        let ok = publish(&mut ws, &msg).await;
        assert_eq!(ok, json!(["OK", msg.id, true, ""]));
        let again = publish(&mut ws, &msg).await;
        assert_eq!(again[2], true);
        assert!(again[3].as_str().unwrap().starts_with("duplicate:"));

        send(&mut ws, json!(["REQ", "sub", {"kinds": [9], "#h": ["lounge"]}])).await;
        assert_eq!(until_eose(&mut ws, "sub").await, vec![msg.id.clone()]);
        handle.abort();
    }

    #[tokio::test]
    async fn ws_rejections_carry_prefixes() {
        let (url, handle) = start(Arc::new(relay())).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let stranger = keys(2);

        let note = stranger.sign(1, now(), vec![], "hi").unwrap();
        let ok = publish(&mut ws, &note).await;
        assert_eq!(ok[2], false);
        assert!(ok[3].as_str().unwrap().starts_with("restricted:"));

        let mut forged = group_event(&stranger, 9, now(), "lounge", vec![]);
        forged.content = "changed".into();
        let ok = publish(&mut ws, &forged).await;
        assert!(ok[3].as_str().unwrap().starts_with("invalid:"));
        handle.abort();
    }

    #[tokio::test]
    async fn ws_live_delivery_between_connections() {
        let (url, handle) = start(Arc::new(relay())).await;
        let (mut author, _) = tokio_tungstenite::connect_async(url.clone()).await.unwrap();
        let (mut reader, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let owner = keys(1);
        lounge(&mut author, &owner).await;

        send(&mut reader, json!(["REQ", "live", {"kinds": [9]}])).await;
        assert!(until_eose(&mut reader, "live").await.is_empty());
        send(&mut reader, json!(["REQ", "other", {"kinds": [10]}])).await;
        assert!(until_eose(&mut reader, "other").await.is_empty());

        let msg = group_event(&owner, 9, now() - 10, "lounge", vec![]);
        publish(&mut author, &msg).await;
        let v = next_json(&mut reader).await;
        assert_eq!(v[0], "EVENT");
        assert_eq!(v[1], "live");
        assert_eq!(v[2]["id"], msg.id.as_str());
        handle.abort();
    }

    #[tokio::test]
    async fn ws_close_stops_delivery() {
        let (url, handle) = start(Arc::new(relay())).await;
        let (mut author, _) = tokio_tungstenite::connect_async(url.clone()).await.unwrap();
        let (mut reader, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let owner = keys(1);
        lounge(&mut author, &owner).await;

        send(&mut reader, json!(["REQ", "s", {"kinds": [9]}])).await;
        until_eose(&mut reader, "s").await;
        send(&mut reader, json!(["CLOSE", "s"])).await;
        // Anything after the CLOSE on the same socket is processed in order.
        send(&mut reader, json!(["COUNT", "c", {"kinds": [9]}])).await;
        assert_eq!(next_json(&mut reader).await, json!(["COUNT", "c", {"count": 0}]));

        publish(&mut author, &group_event(&owner, 9, now() - 5, "lounge", vec![])).await;
        send(&mut reader, json!(["COUNT", "c2", {"kinds": [9]}])).await;
        assert_eq!(next_json(&mut reader).await, json!(["COUNT", "c2", {"count": 1}]));
        handle.abort();
    }

    #[tokio::test]
    async fn ws_group_metadata_is_replaceable() {
        let (url, handle) = start(Arc::new(relay())).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let owner = keys(1);
        lounge(&mut ws, &owner).await;
        for name in ["first", "second"] {
            let edit = group_event(&owner, 9002, now() - 50, "lounge", vec![Tag::new(["name", name])]);
            publish(&mut ws, &edit).await;
        }
        send(&mut ws, json!(["REQ", "m", {"kinds": [39000], "#d": ["lounge"]}])).await;
        let ids = until_eose(&mut ws, "m").await;
        assert_eq!(ids.len(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn ws_limit_zero_returns_eose() {
        let (url, handle) = start(Arc::new(relay())).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        lounge(&mut ws, &keys(1)).await;
        send(&mut ws, json!(["REQ", "s", {"limit": 0}])).await;
        assert!(until_eose(&mut ws, "s").await.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn ws_malformed_messages_get_notices() {
        let (url, handle) = start(Arc::new(relay())).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(TungMessage::Text("not json".into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await[0], "NOTICE");
        ws.send(TungMessage::Text("{}".into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await[0], "NOTICE");
        send(&mut ws, json!(["REQ", "s", {"kinds": "nine"}])).await;
        let v = next_json(&mut ws).await;
        assert_eq!(v[0], "CLOSED");
        assert!(v[2].as_str().unwrap().starts_with("invalid:"));
        send(&mut ws, json!(["REQ", "s", {}])).await;
        assert!(until_eose(&mut ws, "s").await.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn serve_ws_serves_connections() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let shutdown = tokio::time::sleep(std::time::Duration::from_millis(200));
        let handle = tokio::spawn(async move {
            super::serve_ws(addr, Arc::new(relay()), shutdown).await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
            .await
            .unwrap();
        send(&mut ws, json!(["REQ", "s", {"limit": 0}])).await;
        assert!(until_eose(&mut ws, "s").await.is_empty());
        drop(ws);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn serve_ws_bind_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(super::serve_ws(addr, Arc::new(relay()), std::future::pending())
            .await
            .is_err());
    }

    #[test]
    fn encode_wire_messages() {
        assert_eq!(
            encode(&Outbound::Count {
                sub_id: "c".into(),
                count: 3
            }),
            json!(["COUNT", "c", {"count": 3}])
        );
        assert_eq!(
            encode(&closed("s", SLOW_CONSUMER)),
            json!(["CLOSED", "s", "error: slow consumer"])
        );
    }
}
