// =============================================================================
// WebSocket Handler — signals_stream push channel
// =============================================================================
//
// Clients connect to `/api/v1/signals_stream` and receive, in order:
//   1. One `init` message carrying every signal currently known (at most the
//      latest one — the engine keeps no history beyond the most recent).
//   2. A stream of `snapshot` and `new_signal` messages as the `Engine`
//      publishes them to its `EventBus`.
//
// On disconnect the subscriber's queue is simply dropped — there is no
// replay. Uses a `tokio::select!` push/recv loop draining an `EventBus`
// `Subscriber` rather than polling shared state for a version counter.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::event_bus::Event;
use crate::types::{MicroSnapshot, MtfState, Signal};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PushMessage<'a> {
    Init { data: InitData },
    Snapshot { data: &'a MicroSnapshot },
    NewSignal { data: &'a Signal },
    State { data: &'a MtfState },
}

#[derive(Debug, Serialize)]
struct InitData {
    signals: Vec<Signal>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    info!("signals_stream: WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, engine))
}

async fn handle_ws_connection(socket: WebSocket, engine: Arc<Engine>) {
    let (mut sender, mut receiver) = socket.split();
    let subscriber = engine.subscribe();

    let init = PushMessage::Init {
        data: InitData {
            signals: engine.signals_latest().ok().into_iter().collect(),
        },
    };
    if let Err(e) = send_json(&mut sender, &init).await {
        warn!(error = %e, "signals_stream: failed to send init message");
        return;
    }

    loop {
        tokio::select! {
            event = subscriber.recv() => {
                let lag = subscriber.lag_count();
                if lag > 0 {
                    debug!(lag, "signals_stream: subscriber dropped messages under backpressure");
                }
                let sent = match &event {
                    Event::Signal(signal) => {
                        send_json(&mut sender, &PushMessage::NewSignal { data: signal }).await
                    }
                    Event::Snapshot(snapshot) => {
                        send_json(&mut sender, &PushMessage::Snapshot { data: snapshot }).await
                    }
                    Event::State(state) => {
                        send_json(&mut sender, &PushMessage::State { data: state }).await
                    }
                };
                if let Err(e) = sent {
                    debug!(error = %e, "signals_stream: send failed — disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("signals_stream: client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "signals_stream: receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }

    // No replay: the subscriber (and its buffered queue) is simply dropped.
    engine.bus().unsubscribe(subscriber.id());
}

async fn send_json<S>(sender: &mut S, msg: &PushMessage<'_>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "signals_stream: failed to serialize push message");
            Ok(())
        }
    }
}
