// ABOUTME: WebSocket transport for the per-session event stream
// ABOUTME: Forwards gateway events to the client and answers execute/ping messages

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::error::AppError;
use crate::state::AppState;
use corral_executions::ExecutionParams;
use corral_stream::{EventPayload, InboundMessage, StreamEvent};

/// Error code for client messages that cannot be parsed
pub const INVALID_MESSAGE_CODE: &str = "INVALID_MESSAGE";

pub async fn stream_session(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, AppError> {
    state.registry.get(&session_id).await?;
    Ok(ws.on_upgrade(move |socket| run_connection(state, session_id, socket)))
}

async fn run_connection(state: AppState, session_id: String, socket: WebSocket) {
    let mut connection = state.gateway.attach(&session_id);
    let (mut sender, mut receiver) = socket.split();
    info!(
        session_id = %session_id,
        connection_id = connection.id(),
        "Stream connection opened"
    );

    loop {
        tokio::select! {
            event = connection.recv() => {
                let Some(event) = event else {
                    // Session deleted
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_inbound(&state, &session_id, text.as_str()).await {
                        if send_event(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session_id, "Stream socket error: {}", e);
                    break;
                }
            },
        }
    }

    info!(
        session_id = %session_id,
        connection_id = connection.id(),
        "Stream connection closed"
    );
    state.gateway.detach(connection);
}

async fn send_event<S>(sender: &mut S, event: &StreamEvent) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(event).map_err(|_| ())?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Handle one client message; the returned event goes to the sender only
pub async fn handle_inbound(state: &AppState, session_id: &str, text: &str) -> Option<StreamEvent> {
    let message = match serde_json::from_str::<InboundMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            return Some(StreamEvent::direct(
                session_id,
                EventPayload::error(INVALID_MESSAGE_CODE, format!("unrecognised message: {}", e)),
            ))
        }
    };

    match message {
        InboundMessage::Ping => Some(StreamEvent::direct(session_id, EventPayload::Pong)),
        InboundMessage::Execute {
            prompt,
            max_turns,
            timeout_seconds,
            allowed_tools,
            disallowed_tools,
        } => {
            let defaults = ExecutionParams::default();
            let params = ExecutionParams {
                max_turns: max_turns.unwrap_or(defaults.max_turns),
                timeout_seconds: timeout_seconds.unwrap_or(defaults.timeout_seconds),
                allowed_tools: allowed_tools.into_iter().collect(),
                disallowed_tools: disallowed_tools.into_iter().collect(),
            };

            // Success is reported to every connection through execution_started
            match state.runner.submit(session_id, &prompt, params).await {
                Ok(_) => None,
                Err(e) => {
                    let err = AppError::from(e);
                    let (_, code) = err.status_and_code();
                    Some(StreamEvent::direct(
                        session_id,
                        EventPayload::error(code, err.user_message()),
                    ))
                }
            }
        }
    }
}
