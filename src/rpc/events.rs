//! The `/rpc/events` WebSocket endpoint: first frame subscribes, then the
//! server streams [`Event`] JSON until the peer closes or the connection's
//! context is cancelled.

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::events::{EventBus, Filter};
use crate::errors::{Error, Result};

/// First frame sent by the client over `/rpc/events`.
#[derive(Debug, Deserialize, Default)]
struct SubscribeRequest {
    service: Option<String>,
    #[serde(default)]
    all: bool,
}

/// Handle an already-upgraded `/rpc/events` connection end to end.
pub async fn serve(
    upgraded: Upgraded,
    events: EventBus,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let io = TokioIo::new(upgraded);
    let ws = WebSocketStream::from_raw_socket(io, tokio_tungstenite::tungstenite::protocol::Role::Server, None).await;
    let (mut sink, mut stream) = ws.split();

    let first = stream
        .next()
        .await
        .ok_or_else(|| Error::InvalidInput("events session closed before subscribe frame".into()))?
        .map_err(|e| Error::Transient(format!("websocket error: {e}")))?;
    let subscribe: SubscribeRequest = match first {
        Message::Text(text) => {
            serde_json::from_str(&text).map_err(|e| Error::InvalidInput(format!("malformed subscribe frame: {e}")))?
        }
        _ => return Err(Error::InvalidInput("first events frame must be text JSON".into())),
    };

    let filter = match (subscribe.all, subscribe.service) {
        (true, _) => Filter::all(),
        (false, Some(service)) => Filter::for_service(service),
        (false, None) => Filter::all(),
    };

    let mut subscription = events.subscribe(filter).await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                }
            }
            evt = subscription.recv() => {
                let Some(evt) = evt else { break };
                let text = serde_json::to_string(&evt).unwrap();
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    Ok(())
}
