//! The `/rpc/exec` WebSocket endpoint: upgrades the HTTP connection, reads
//! the first-frame [`ExecRequest`], then bridges binary stdin/stdout frames
//! and JSON control frames to a [`crate::dispatcher`] session.

use std::net::IpAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::dispatcher::{Collaborators, ExecSession};
use crate::errors::{Error, Result};
use crate::rpc::authorize::PeerIdentity;

/// First frame sent by the client over `/rpc/exec`.
#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub service: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub payload_name: Option<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub rows: u16,
    #[serde(default)]
    pub cols: u16,
}

/// Control frames sent/received as JSON text frames during the session.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    Resize { rows: u16, cols: u16 },
    StdinClose,
    Exit { code: i32, error: Option<String> },
}

/// Channel pair bridging the websocket transport to a dispatcher session,
/// kept transport-agnostic so dispatcher verbs don't depend on
/// tungstenite types.
pub struct ExecChannel {
    pub stdin_rx: mpsc::Receiver<Vec<u8>>,
    pub stdout_tx: mpsc::Sender<Vec<u8>>,
    pub resize_rx: mpsc::Receiver<(u16, u16)>,
}

/// Handle an already-upgraded `/rpc/exec` connection end to end.
pub async fn serve(
    upgraded: Upgraded,
    collaborators: Arc<Collaborators>,
    peer: PeerIdentity,
    remote_ip: IpAddr,
) -> Result<()> {
    let io = TokioIo::new(upgraded);
    let ws = WebSocketStream::from_raw_socket(io, tokio_tungstenite::tungstenite::protocol::Role::Server, None).await;
    let (mut sink, mut stream) = ws.split();

    let first = stream
        .next()
        .await
        .ok_or_else(|| Error::InvalidInput("exec session closed before first frame".into()))?
        .map_err(|e| Error::Transient(format!("websocket error: {e}")))?;
    let request: ExecRequest = match first {
        Message::Text(text) => serde_json::from_str(&text)
            .map_err(|e| Error::InvalidInput(format!("malformed ExecRequest: {e}")))?,
        _ => return Err(Error::InvalidInput("first exec frame must be text JSON".into())),
    };

    let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(32);
    let mut stdin_tx = Some(stdin_tx);
    let (stdout_tx, mut stdout_rx) = mpsc::channel::<Vec<u8>>(32);
    let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(8);

    let session = ExecSession {
        service: request.service.clone(),
        run_as_user: request.user.clone(),
        args: request.args.clone(),
        payload_name: request.payload_name.clone(),
        tty: request.tty,
        term: request.term.clone(),
        rows: request.rows,
        cols: request.cols,
        peer,
        remote_ip,
    };

    let channel = ExecChannel {
        stdin_rx,
        stdout_tx,
        resize_rx,
    };

    let dispatch = tokio::spawn(async move { crate::dispatcher::run(collaborators, session, channel).await });

    loop {
        tokio::select! {
            frame = stream.next() => {
                let Some(frame) = frame else { break };
                let frame = frame.map_err(|e| Error::Transient(format!("websocket error: {e}")))?;
                match frame {
                    Message::Binary(bytes) => {
                        if let Some(tx) = &stdin_tx {
                            if tx.send(bytes.to_vec()).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Text(text) => {
                        match serde_json::from_str::<ControlFrame>(&text) {
                            Ok(ControlFrame::Resize { rows, cols }) => {
                                let _ = resize_tx.send((rows, cols)).await;
                            }
                            Ok(ControlFrame::StdinClose) => {
                                stdin_tx = None;
                            }
                            _ => {}
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            chunk = stdout_rx.recv() => {
                match chunk {
                    Some(bytes) => {
                        sink.send(Message::Binary(bytes.into())).await
                            .map_err(|e| Error::Transient(format!("websocket error: {e}")))?;
                    }
                    None => break,
                }
            }
        }
    }

    let outcome = dispatch
        .await
        .map_err(|e| Error::Internal(format!("exec session task panicked: {e}")))?;

    let exit = match outcome {
        Ok(code) => ControlFrame::Exit { code, error: None },
        Err(err) => ControlFrame::Exit {
            code: -1,
            error: Some(err.to_string()),
        },
    };
    let text = serde_json::to_string(&exit).unwrap();
    let _ = sink.send(Message::Text(text.into())).await;
    let _ = sink.close().await;
    Ok(())
}
