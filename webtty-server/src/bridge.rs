use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webtty_common::{ClientFrame, ServerFrame};

use crate::pty::{PtyProcess, PtyResizer};

/// All server frames funnel through one bounded queue consumed by a single
/// writer task, so WebSocket writes never interleave and a slow peer cannot
/// grow memory without bound.
const FRAME_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub permit_write: bool,
    /// Non-zero values pin the pty dimensions regardless of client resizes.
    pub fixed_cols: u16,
    pub fixed_rows: u16,
}

/// Couple one WebSocket peer to one pty until either side ends.
///
/// `greeting` frames are written first, in order, before any output. The
/// function returns when either pump finishes; the caller performs child
/// teardown afterwards.
pub async fn run(
    socket: WebSocket,
    pty: &mut PtyProcess,
    greeting: Vec<ServerFrame>,
    settings: BridgeSettings,
) {
    let Some(output_rx) = pty.take_output() else {
        return;
    };
    let input_tx = pty.input_sender();
    let resizer = pty.resizer();

    let (frame_tx, frame_rx) = mpsc::channel::<ServerFrame>(FRAME_QUEUE);
    for frame in greeting {
        if frame_tx.send(frame).await.is_err() {
            return;
        }
    }

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_pump(frame_rx, ws_tx));
    let mut output = tokio::spawn(output_pump(output_rx, frame_tx.clone()));
    let mut input = tokio::spawn(input_pump(
        ws_rx,
        input_tx,
        frame_tx.clone(),
        resizer,
        settings,
    ));
    drop(frame_tx);

    tokio::select! {
        _ = &mut output => input.abort(),
        _ = &mut input => output.abort(),
    }

    // Remaining frame senders are gone; the writer drains the queue, closes
    // the socket and exits.
    let _ = writer.await;
}

async fn write_pump(
    mut frames: mpsc::Receiver<ServerFrame>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    while let Some(frame) = frames.recv().await {
        let text: Utf8Bytes = frame.encode().into();
        if sink.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn output_pump(mut output: mpsc::Receiver<Bytes>, frames: mpsc::Sender<ServerFrame>) {
    while let Some(chunk) = output.recv().await {
        if frames
            .send(ServerFrame::Output(chunk.to_vec()))
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn input_pump(
    mut stream: SplitStream<WebSocket>,
    input: mpsc::Sender<Bytes>,
    frames: mpsc::Sender<ServerFrame>,
    resizer: PtyResizer,
    settings: BridgeSettings,
) {
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return,
            // The protocol is text-framed; transport pings are answered by
            // the library and everything else is ignored.
            _ => continue,
        };
        let frame = match ClientFrame::decode(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed client frame, closing session");
                return;
            }
        };
        match frame {
            ClientFrame::Input(data) => {
                if !settings.permit_write {
                    continue;
                }
                if input.send(Bytes::from(data.into_bytes())).await.is_err() {
                    return;
                }
            }
            ClientFrame::Ping => {
                if frames.send(ServerFrame::Pong).await.is_err() {
                    return;
                }
            }
            ClientFrame::Resize(window) => {
                let cols = if settings.fixed_cols > 0 {
                    settings.fixed_cols
                } else {
                    window.cols()
                };
                let rows = if settings.fixed_rows > 0 {
                    settings.fixed_rows
                } else {
                    window.rows()
                };
                if cols == 0 || rows == 0 {
                    debug!(cols, rows, "ignoring resize to zero dimensions");
                    continue;
                }
                if let Err(e) = resizer.resize(cols, rows) {
                    warn!(error = %e, "failed to resize pty window");
                }
            }
            ClientFrame::Unknown(tag) => {
                debug!(tag, "ignoring unknown frame tag");
            }
        }
    }
}
