//! Per-session gate for outgoing key messages

use std::sync::Arc;

use crate::action::KeyAction;
use crate::post_lookup::{PostLookupEntries, PostLookupStore};
use crate::protocol::KeyMessage;

/// Filters and remaps the key messages of one session.
///
/// The gate stays closed until the session reports its name. Once open it
/// forwards messages unchanged unless the session's post-lookup table has an
/// entry for the composite code, in which case the remapped message is built
/// in a buffer owned by the gate.
#[derive(Debug)]
pub struct LinkGate {
    enabled: bool,
    name: String,
    table: Option<Arc<PostLookupEntries>>,
    replacement: KeyMessage,
}

impl Default for LinkGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkGate {
    pub fn new() -> Self {
        Self {
            enabled: false,
            name: String::new(),
            table: None,
            replacement: KeyMessage {
                action: KeyAction::Released,
                code: 0,
            },
        }
    }

    /// Bind the session name, open the gate and resolve its table
    pub fn identify(&mut self, name: &str, store: &PostLookupStore) {
        self.name = name.to_string();
        self.enabled = true;
        self.reload(store);

        tracing::info!(
            "Session '{}' identified ({})",
            self.name,
            if self.table.is_some() {
                "post-lookup active"
            } else {
                "no post-lookup"
            }
        );
    }

    /// Re-resolve the table after the store changed
    pub fn reload(&mut self, store: &PostLookupStore) {
        self.table = store.find(&self.name);
    }

    pub fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }

    /// Message to send for `message`, or `None` while the gate is closed
    pub fn filter<'a>(&'a mut self, message: &'a KeyMessage) -> Option<&'a KeyMessage> {
        if !self.enabled {
            return None;
        }

        let replacement = self
            .table
            .as_ref()
            .and_then(|table| table.get(&message.code).copied());

        match replacement {
            None => Some(message),
            Some(code) => {
                self.replacement.action = message.action;
                self.replacement.code = code;
                Some(&self.replacement)
            }
        }
    }
}
