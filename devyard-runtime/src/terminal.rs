//! Streaming endpoint: WebSocket transport for interactive terminals.
//!
//! A small JSON control protocol is multiplexed over the socket:
//! `input`/`resize` from the client, `output`/`request-resize` from the
//! server. Closing the socket detaches the PTY; the tmux session survives
//! for the next attach.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::api::{AppState, error_response};
use crate::auth::CallerIdentity;
use crate::error::{OrchestratorError, Result};
use crate::sandbox::PtySize;
use crate::store::SessionStatus;
use crate::store::entity::{environments, sessions};

/// Size assumed until the client answers `request-resize`.
const INITIAL_SIZE: PtySize = PtySize { cols: 80, rows: 24 };

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Output { data: String },
    RequestResize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalQuery {
    environment_id: Option<String>,
}

pub async fn terminal_ws(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(session_id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Resolve and authorize before upgrading so failures surface as plain
    // HTTP errors instead of an immediately-closed socket.
    let (session, env) = match state
        .service
        .session_with_environment(&caller, &session_id)
        .await
    {
        Ok(pair) => pair,
        Err(err) => return error_response(&err),
    };
    if let Some(expected) = query.environment_id {
        if expected != env.id {
            return error_response(&OrchestratorError::NotFound(format!(
                "session {session_id} not found in environment {expected}"
            )));
        }
    }
    if session.status == SessionStatus::Dead.as_str() {
        return error_response(&OrchestratorError::State(format!(
            "session {session_id} is dead"
        )));
    }

    ws.on_upgrade(move |socket| async move {
        let session_id = session.id.clone();
        if let Err(err) = pump(state.clone(), socket, env, session).await {
            warn!("terminal stream for session {session_id} ended: {err}");
        }
        state.broker.detached(&session_id).await;
    })
}

async fn pump(
    state: AppState,
    mut socket: WebSocket,
    env: environments::Model,
    session: sessions::Model,
) -> Result<()> {
    let mut stream = match state.broker.open(&env, &session, INITIAL_SIZE).await {
        Ok(stream) => stream,
        Err(err) => {
            // Give the client a reason before hanging up.
            let frame = ServerFrame::Output {
                data: format!("devyard: {err}\r\n"),
            };
            let _ = socket
                .send(Message::Text(serde_json::to_string(&frame).unwrap_or_default().into()))
                .await;
            return Err(err);
        }
    };

    // tmux renders to whatever size we attached with; ask the client for
    // the real one straight away.
    let request = serde_json::to_string(&ServerFrame::RequestResize)
        .map_err(|err| OrchestratorError::Runtime(format!("frame encode: {err}")))?;
    if socket.send(Message::Text(request.into())).await.is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Input { data }) => {
                                stream
                                    .input
                                    .write_all(data.as_bytes())
                                    .await
                                    .map_err(|err| {
                                        OrchestratorError::Runtime(format!("pty write: {err}"))
                                    })?;
                                let _ = stream.input.flush().await;
                                let _ = state.store.touch_session(&session.id).await;
                            }
                            Ok(ClientFrame::Resize { cols, rows }) => {
                                stream.resize(PtySize { cols, rows });
                            }
                            Err(err) => debug!("ignoring malformed frame: {err}"),
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
            chunk = stream.output.next() => {
                match chunk {
                    None => break,
                    Some(Err(err)) => {
                        debug!("pty output ended for session {}: {err}", session.id);
                        break;
                    }
                    Some(Ok(bytes)) => {
                        let frame = ServerFrame::Output {
                            data: String::from_utf8_lossy(&bytes).into_owned(),
                        };
                        let payload = serde_json::to_string(&frame).map_err(|err| {
                            OrchestratorError::Runtime(format!("frame encode: {err}"))
                        })?;
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse() {
        assert_eq!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"input","data":"echo hi\n"}"#).unwrap(),
            ClientFrame::Input {
                data: "echo hi\n".to_string()
            }
        );
        assert_eq!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"resize","cols":120,"rows":30}"#)
                .unwrap(),
            ClientFrame::Resize {
                cols: 120,
                rows: 30
            }
        );
    }

    #[test]
    fn unknown_client_frame_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"detach"}"#).is_err());
    }

    #[test]
    fn server_frames_serialize() {
        assert_eq!(
            serde_json::to_string(&ServerFrame::Output {
                data: "hi\r\n".to_string()
            })
            .unwrap(),
            r#"{"type":"output","data":"hi\r\n"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerFrame::RequestResize).unwrap(),
            r#"{"type":"request-resize"}"#
        );
    }
}
