//! The terminal WebSocket endpoint.
//!
//! One socket is one subscriber to a (possibly pre-existing) session: on
//! attach the client receives the replay snapshot as a single `output`
//! frame, then live output; `input` and `resize` frames flow the other way.
//! Closing the socket leaves the session running for later reconnection.

use std::sync::Arc;

use aerosol::axum::Dep;
use axum::{
    extract::{
        Query, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use clients::warden::v1::TerminalMessage;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::terminal::{
    TerminalSessionManager,
    session::{SessionOptions, TerminalSession},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalQuery {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub shell: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub working_dir: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub cols: Option<u16>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub rows: Option<u16>,
}

/// Clients routinely send `?cols=&rows=&sessionId=` with values left blank;
/// a blank parameter means "not provided", not a parse error.
fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = Option::<String>::deserialize(deserializer)?;
    match value.as_deref() {
        None | Some("") => Ok(None),
        Some(text) => text.parse::<T>().map(Some).map_err(serde::de::Error::custom),
    }
}

#[tracing::instrument(skip(terminals, upgrade))]
pub async fn ws(
    Dep(terminals): Dep<TerminalSessionManager>,
    Query(query): Query<TerminalQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| attach(socket, terminals, query))
}

async fn attach(socket: WebSocket, terminals: TerminalSessionManager, query: TerminalQuery) {
    let (mut sender, mut receiver) = socket.split();

    let id = query
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let options = SessionOptions {
        shell: query.shell.clone(),
        working_dir: query.working_dir.clone(),
        env: Vec::new(),
        cols: query.cols.unwrap_or(80),
        rows: query.rows.unwrap_or(24),
    };

    let session = match terminals.get_or_create(&id, &options) {
        Ok(session) => session,
        Err(err) => {
            warn!(id, %err, "terminal.ws.session_failed");
            let _ = send(&mut sender, &TerminalMessage::Error {
                data: err.to_string(),
            })
            .await;
            return;
        }
    };

    let (subscriber_id, snapshot, output) = session.subscribe();
    if !snapshot.is_empty() {
        let frame = TerminalMessage::Output {
            data: String::from_utf8_lossy(&snapshot).into_owned(),
        };
        if send(&mut sender, &frame).await.is_err() {
            session.unsubscribe(subscriber_id);
            return;
        }
    }

    let done = session.done();
    info!(id = %session.id, subscriber_id, "terminal.ws.attached");
    loop {
        tokio::select! {
            chunk = output.recv_async() => {
                let Ok(chunk) = chunk else { break };
                let frame = TerminalMessage::Output {
                    data: String::from_utf8_lossy(&chunk).into_owned(),
                };
                if send(&mut sender, &frame).await.is_err() {
                    break;
                }
            }
            message = next_frame(&mut receiver) => {
                match message {
                    Some(text) => handle_frame(&mut sender, &session, &text).await,
                    None => break,
                }
            }
            _ = done.cancelled() => {
                let _ = send(&mut sender, &TerminalMessage::Error {
                    data: "terminal session closed".into(),
                })
                .await;
                break;
            }
        }
    }
    session.unsubscribe(subscriber_id);
    debug!(id = %session.id, subscriber_id, "terminal.ws.detached");
}

/// Next inbound text frame, or `None` when the socket is done.
async fn next_frame(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => return Some(text.to_string()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => {}
        }
    }
}

async fn handle_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    session: &Arc<TerminalSession>,
    text: &str,
) {
    let frame = match serde_json::from_str::<TerminalMessage>(text) {
        Ok(frame) => frame,
        Err(err) => {
            let _ = send(sender, &TerminalMessage::Error {
                data: format!("unparseable frame: {err}"),
            })
            .await;
            return;
        }
    };
    let result = match frame {
        TerminalMessage::Input { data } => session.write(data.as_bytes()),
        TerminalMessage::Resize { cols, rows } => session.resize(cols, rows),
        // Server-to-client frames arriving inbound are ignored.
        TerminalMessage::Output { .. } | TerminalMessage::Error { .. } => Ok(()),
    };
    if let Err(err) = result {
        let _ = send(sender, &TerminalMessage::Error {
            data: err.to_string(),
        })
        .await;
    }
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &TerminalMessage,
) -> Result<(), axum::Error> {
    let encoded = serde_json::to_string(frame).expect("terminal frames serialize");
    sender.send(Message::Text(encoded.into())).await
}
