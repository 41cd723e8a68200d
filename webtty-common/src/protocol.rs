use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// WebSocket subprotocol advertised during the upgrade. Existing front-ends
/// negotiate this name, so it is part of the wire contract.
pub const SUBPROTOCOL: &str = "gotty";

// Client -> server frame tags.
pub const INPUT: u8 = b'0';
pub const PING: u8 = b'1';
pub const RESIZE_TERMINAL: u8 = b'2';

// Server -> client frame tags.
pub const OUTPUT: u8 = b'0';
pub const PONG: u8 = b'1';
pub const SET_WINDOW_TITLE: u8 = b'2';
pub const SET_PREFERENCES: u8 = b'3';
pub const SET_RECONNECT: u8 = b'4';

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag {0:?}")]
    UnknownTag(char),
    #[error("malformed frame payload: {0}")]
    Payload(String),
}

/// First message a client sends after the upgrade. Field names are fixed by
/// the front-end emulator.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitMessage {
    #[serde(rename = "Arguments", default)]
    pub arguments: String,
    #[serde(rename = "AuthToken", default)]
    pub auth_token: String,
}

/// RESIZE payload. The emulator serializes dimensions as JSON numbers which
/// may arrive as floats, so decoding is tolerant and exposes clamped values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowSize {
    pub columns: f64,
    pub rows: f64,
}

impl WindowSize {
    pub fn cols(&self) -> u16 {
        clamp_dimension(self.columns)
    }

    pub fn rows(&self) -> u16 {
        clamp_dimension(self.rows)
    }
}

fn clamp_dimension(value: f64) -> u16 {
    if value.is_finite() && value > 0.0 {
        value.min(f64::from(u16::MAX)) as u16
    } else {
        0
    }
}

/// A frame received from the terminal emulator.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Raw keystrokes, forwarded verbatim to the pty.
    Input(String),
    /// Liveness probe; answered with [`ServerFrame::Pong`].
    Ping,
    /// Window dimension change.
    Resize(WindowSize),
    /// Unrecognized tag, ignored by the receiver.
    Unknown(u8),
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let Some(&tag) = text.as_bytes().first() else {
            return Err(FrameError::Empty);
        };
        // Known tags are ASCII, so slicing off one byte stays on a char
        // boundary; anything else is returned without touching the payload.
        match tag {
            INPUT => Ok(Self::Input(text[1..].to_string())),
            PING => Ok(Self::Ping),
            RESIZE_TERMINAL => {
                let size: WindowSize = serde_json::from_str(&text[1..])
                    .map_err(|e| FrameError::Payload(e.to_string()))?;
                Ok(Self::Resize(size))
            }
            other => Ok(Self::Unknown(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Input(data) => frame(INPUT, data),
            Self::Ping => frame(PING, ""),
            Self::Resize(size) => {
                let payload = serde_json::json!({
                    "columns": size.columns,
                    "rows": size.rows,
                });
                frame(RESIZE_TERMINAL, &payload.to_string())
            }
            Self::Unknown(tag) => String::from_utf8_lossy(&[*tag]).into_owned(),
        }
    }
}

/// A frame sent to the terminal emulator.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Pty output. Carried base64-encoded because output may contain
    /// arbitrary bytes while the framing channel is UTF-8 text.
    Output(Vec<u8>),
    /// Liveness reply, empty payload.
    Pong,
    /// Rendered window title.
    SetWindowTitle(String),
    /// Terminal emulator preference object.
    SetPreferences(serde_json::Value),
    /// Reconnect delay hint, in seconds.
    SetReconnect(u32),
}

impl ServerFrame {
    pub fn encode(&self) -> String {
        match self {
            Self::Output(bytes) => frame(OUTPUT, &BASE64.encode(bytes)),
            Self::Pong => frame(PONG, ""),
            Self::SetWindowTitle(title) => frame(SET_WINDOW_TITLE, title),
            Self::SetPreferences(prefs) => {
                frame(SET_PREFERENCES, &prefs.to_string())
            }
            Self::SetReconnect(seconds) => frame(SET_RECONNECT, &seconds.to_string()),
        }
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let Some(&tag) = text.as_bytes().first() else {
            return Err(FrameError::Empty);
        };
        match tag {
            OUTPUT => BASE64
                .decode(&text[1..])
                .map(Self::Output)
                .map_err(|e| FrameError::Payload(e.to_string())),
            PONG => Ok(Self::Pong),
            SET_WINDOW_TITLE => Ok(Self::SetWindowTitle(text[1..].to_string())),
            SET_PREFERENCES => serde_json::from_str(&text[1..])
                .map(Self::SetPreferences)
                .map_err(|e| FrameError::Payload(e.to_string())),
            SET_RECONNECT => text[1..]
                .parse()
                .map(Self::SetReconnect)
                .map_err(|e| FrameError::Payload(e.to_string())),
            other => Err(FrameError::UnknownTag(other as char)),
        }
    }
}

fn frame(tag: u8, payload: &str) -> String {
    let mut out = String::with_capacity(payload.len() + 1);
    out.push(tag as char);
    out.push_str(payload);
    out
}
