use log::{debug, warn};
use std::sync::Arc;

use actix_ws::{Closed, Message, MessageStream, Session};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::broadcast::{Broadcaster, Delivery, Subscriber};
use crate::error::{AppError, ErrorKind};
use crate::gpio::{ChangeEvent, LineBackend, PinManager};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Read {
        #[serde(alias = "pin")]
        line_id: u32,
    },
    Write {
        #[serde(alias = "pin")]
        line_id: u32,
        value: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Outbound payload, both command replies and pushed changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
}

impl Reply {
    fn success(action: &'static str, line_id: u32, value: bool) -> Self {
        Self {
            status: Status::Success,
            action: Some(action),
            line_id: Some(line_id),
            value: Some(value),
            error: None,
            kind: None,
            timestamp_ms: None,
        }
    }

    fn failure(action: &'static str, line_id: u32, err: &AppError) -> Self {
        Self {
            status: Status::Error,
            action: Some(action),
            line_id: Some(line_id),
            value: None,
            error: Some(err.to_string()),
            kind: Some(err.kind()),
            timestamp_ms: None,
        }
    }

    fn bare_error(kind: ErrorKind, message: String) -> Self {
        Self {
            status: Status::Error,
            action: None,
            line_id: None,
            value: None,
            error: Some(message),
            kind: Some(kind),
            timestamp_ms: None,
        }
    }

    pub fn invalid_format() -> Self {
        Self::bare_error(ErrorKind::InvalidFormat, "Invalid JSON format".into())
    }

    pub fn lagged(missed: u64) -> Self {
        Self::bare_error(
            ErrorKind::Lagged,
            format!("Event stream lagged by {missed} messages"),
        )
    }

    pub fn change(event: &ChangeEvent) -> Self {
        Self {
            timestamp_ms: Some(event.timestamp_ms),
            ..Self::success("change", event.line_id, event.value)
        }
    }
}

/// Handles one inbound command payload and builds the reply for it.
pub fn dispatch<B: LineBackend>(manager: &PinManager<B>, payload: &str) -> Reply {
    let command: Command = match serde_json::from_str(payload) {
        Ok(command) => command,
        Err(e) => {
            debug!("rejecting malformed command: {e}");
            return Reply::invalid_format();
        }
    };

    match command {
        Command::Write { line_id, value } => match manager.write(line_id, value) {
            Ok(()) => Reply::success("write", line_id, value),
            Err(e) => Reply::failure("write", line_id, &e),
        },
        Command::Read { line_id } => match manager.read(line_id) {
            Ok(value) => Reply::success("read", line_id, value),
            Err(e) => Reply::failure("read", line_id, &e),
        },
    }
}

async fn send_reply(session: &mut Session, reply: &Reply) -> Result<(), Closed> {
    match serde_json::to_string(reply) {
        Ok(text) => session.text(text).await,
        Err(e) => {
            warn!("failed to encode reply: {e}");
            Ok(())
        }
    }
}

/// Runs both loops of one websocket subscriber and unsubscribes it when the
/// client goes away.
pub async fn serve_connection<B: LineBackend + 'static>(
    session: Session,
    client_stream: MessageStream,
    manager: Arc<PinManager<B>>,
    broadcaster: Arc<Broadcaster>,
    subscriber: Subscriber,
) {
    let subscriber_id = subscriber.id();
    let outbound = actix_web::rt::spawn(deliver_events(
        session.clone(),
        subscriber,
        broadcaster.clone(),
    ));

    read_commands(session, client_stream, &manager).await;

    broadcaster.unsubscribe(subscriber_id);
    let _ = outbound.await;
}

async fn read_commands<B: LineBackend>(
    mut session: Session,
    mut client_stream: MessageStream,
    manager: &PinManager<B>,
) {
    while let Some(msg) = client_stream.recv().await {
        let reply = match msg {
            Ok(Message::Text(text)) => dispatch(manager, &text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatch(manager, text),
                Err(_) => Reply::invalid_format(),
            },
            Ok(Message::Ping(bytes)) => {
                if session.pong(&bytes).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Message::Close(reason)) => {
                let _ = session.close(reason).await;
                break;
            }
            Ok(Message::Pong(_)) | Ok(Message::Continuation(_)) | Ok(Message::Nop) => continue,
            Err(e) => {
                debug!("websocket read failed: {e}");
                break;
            }
        };

        if send_reply(&mut session, &reply).await.is_err() {
            warn!("WebSocket client disconnected");
            break;
        }
    }
}

async fn deliver_events(mut session: Session, subscriber: Subscriber, broadcaster: Arc<Broadcaster>) {
    let subscriber_id = subscriber.id();
    let deliveries = subscriber.into_stream();
    tokio::pin!(deliveries);

    while let Some(delivery) = deliveries.next().await {
        let reply = match delivery {
            Delivery::Event(event) => Reply::change(&event),
            Delivery::Lagged(missed) => {
                warn!("subscriber {subscriber_id} lagged by {missed} events");
                Reply::lagged(missed)
            }
        };

        if send_reply(&mut session, &reply).await.is_err() {
            warn!("subscriber {subscriber_id} disconnected during delivery");
            broadcaster.unsubscribe(subscriber_id);
            return;
        }
    }

    // subscription closed from our side, e.g. on drain
    let _ = session.close(None).await;
}
