//! # Wire Protocol
//!
//! Defines the vocabulary shared by the WebSocket bridge and the upstream
//! connectors:
//! - Client frame discriminators for SSH sessions (data / heartbeat / window)
//! - The JSON handshake records exchanged with the SSH relay
//! - Window-resize message parsing
//! - A UTF-8 carry buffer for terminal output split across reads

use serde::{Deserialize, Serialize};

// ─── Client Frame Discriminators ────────────────────────────────

/// First byte of an SSH client frame carrying terminal input.
pub const FRAME_DATA: u8 = b'1';

/// First byte of an SSH client heartbeat frame. The payload is ignored.
pub const FRAME_HEARTBEAT: u8 = b'9';

/// First byte of an SSH client window-resize frame. The payload is
/// `"<w>,<h>[,<dpi>]"`.
pub const FRAME_WINDOW: u8 = b'w';

/// Red ANSI banner written to the primary client when an administrator
/// terminates the session.
pub const ADMIN_CLOSE_BANNER: &str = "\r\n \x1b[31m closed by admin";

// ─── Relay Handshake ────────────────────────────────────────────

/// What the gateway asks the SSH relay to do on behalf of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayAction {
    /// Open a new session to the target asset.
    New,
    /// Attach to an existing session as a read-only observer.
    Monitor,
    /// Terminate an existing session.
    Close,
}

/// The single JSON line written to the relay's stdin, terminated by `\r`.
///
/// `session_id` is empty for [`RelayAction::New`]; for `Monitor` and
/// `Close` it names the session the relay should act on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub uid: i64,
    pub username: String,
    pub client_ip: String,
    pub cookie: String,
    pub accept_language: String,
    pub asset_id: i64,
    pub account_id: i64,
    pub protocol: String,
    pub action: RelayAction,
    pub session_id: String,
}

/// The single JSON line the relay answers with, terminated by `\r`.
///
/// `code` zero means success; anything else carries a relay-side failure
/// in `message`. For new sessions `session_id` is the relay-assigned
/// opaque handle used for every later operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponse {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub username: String,
}

// ─── Window Resize ──────────────────────────────────────────────

/// A terminal / screen geometry update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
}

impl WindowSize {
    /// Parses a `"<w>,<h>[,<dpi>]"` payload.
    ///
    /// Returns `None` for anything malformed or for zero dimensions;
    /// callers drop such frames silently.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(',');
        let width: u32 = parts.next()?.trim().parse().ok()?;
        let height: u32 = parts.next()?.trim().parse().ok()?;
        let dpi: u32 = match parts.next() {
            Some(d) => d.trim().parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() || width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height, dpi })
    }

    /// Reads `w`, `h` and `dpi` query parameters, falling back to the
    /// given defaults for anything absent or unparsable.
    pub fn from_query(
        query: &std::collections::HashMap<String, String>,
        default_w: u32,
        default_h: u32,
        default_dpi: u32,
    ) -> Self {
        let get = |key: &str, fallback: u32| {
            query
                .get(key)
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|&v| v > 0)
                .unwrap_or(fallback)
        };
        Self {
            width: get("w", default_w),
            height: get("h", default_h),
            dpi: get("dpi", default_dpi),
        }
    }
}

// ─── UTF-8 Carry Buffer ─────────────────────────────────────────

/// Accumulates upstream terminal bytes and yields only complete UTF-8.
///
/// Terminal output arrives in arbitrary chunks, so a multibyte sequence
/// may be split across two reads. Text frames on the WebSocket must be
/// valid UTF-8, so each push returns the longest valid prefix and holds
/// back an incomplete trailing sequence for the next read. Invalid
/// sequences are skipped.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Appends `bytes` and drains everything decodable right now.
    ///
    /// Returns `None` when nothing complete is available yet.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&self.pending[..valid_up_to]) {
                        out.push_str(valid);
                    }
                    match err.error_len() {
                        // An invalid sequence in the middle: skip it.
                        Some(bad) => {
                            self.pending.drain(..valid_up_to + bad);
                        }
                        // An incomplete sequence at the end: keep it for
                        // the next read.
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}
