//! Session wire messages
//!
//! Messages are JSON objects, one per line, discriminated by a `type` field:
//! - daemon → session: `{"type": "name"}` (once, right after connect)
//! - session → daemon: `{"type": "name", "name": "..."}`
//! - daemon → session: `{"type": "key", "action": "pressed", "code": 30}`
//!
//! Key messages carry no reply.

use serde::{Deserialize, Serialize};

use crate::action::KeyAction;

/// Longest session name kept from a Name reply, in characters
pub const NAME_LIMIT: usize = 20;

/// A key action as sent to a session. `code` is a composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMessage {
    pub action: KeyAction,
    pub code: u32,
}

/// Messages sent from the daemon to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Ask the session to report its name
    Name,
    Key(KeyMessage),
}

/// Messages sent from a session to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Reply to [`ServerMessage::Name`]
    Name { name: String },
}

/// Clamp a reported session name to [`NAME_LIMIT`] characters
pub fn clamp_name(name: &str) -> String {
    let name = name.trim();
    match name.char_indices().nth(NAME_LIMIT) {
        Some((end, _)) => {
            tracing::warn!("Session name '{}' longer than {} characters, truncated", name, NAME_LIMIT);
            name[..end].to_string()
        }
        None => name.to_string(),
    }
}
