//! Named key translation tables
//!
//! A [`KeyTable`] maps raw scan codes to an output code plus a modifier mask.
//! Every mutation records a signed reference delta per output code; the owning
//! [`crate::router::EventRouter`] drains those deltas after each control-plane
//! call and reports them to the backend as one batch.
//!
//! Tables are not internally locked. Mutating a table concurrently with key
//! events against it must be serialized by the caller; the router does that
//! by running both under its state lock.

use std::collections::BTreeMap;
use std::path::Path;

use virtual_input_config::{KeyRow, KeyTableDocument, ModifierMask};

use crate::error::InputError;

/// Translation result for one raw code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionInfo {
    pub code: u16,
    pub modifiers: ModifierMask,
}

/// Signed reference-count adjustments per output code
pub type MapChanges = BTreeMap<u16, i32>;

/// Raw code → [`ConversionInfo`] mapping with unique raw codes
#[derive(Debug, Default)]
pub struct KeyTable {
    entries: BTreeMap<u32, ConversionInfo>,
    pass_through: bool,
    changes: MapChanges,
}

impl KeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether lookups are bypassed and raw codes forwarded unchanged
    pub fn pass_through(&self) -> bool {
        self.pass_through
    }

    pub fn set_pass_through(&mut self, enabled: bool) {
        self.pass_through = enabled;
    }

    pub fn lookup(&self, code: u32) -> Option<ConversionInfo> {
        self.entries.get(&code).copied()
    }

    /// Insert a mapping. Returns `false` and leaves the table untouched if
    /// `code` is already mapped.
    pub fn add(&mut self, code: u32, key: u16, modifiers: ModifierMask) -> bool {
        if self.entries.contains_key(&code) {
            return false;
        }

        self.entries.insert(code, ConversionInfo { code: key, modifiers });
        self.record(key, 1);
        true
    }

    /// Remove a mapping; absent codes are ignored.
    pub fn delete(&mut self, code: u32) {
        if let Some(info) = self.entries.remove(&code) {
            self.record(info.code, -1);
        }
    }

    /// Replace (or create) a mapping. Always succeeds.
    pub fn modify(&mut self, code: u32, key: u16, modifiers: ModifierMask) -> bool {
        self.delete(code);
        self.add(code, key, modifiers)
    }

    /// Replace the table contents with the rows of the document at `path`.
    ///
    /// Returns the number of malformed rows. Duplicate codes after the first
    /// occurrence are rejected the same way [`KeyTable::add`] rejects them and
    /// are not counted as malformed.
    pub fn load(&mut self, path: &Path) -> Result<usize, InputError> {
        let document = virtual_input_config::parse_key_table(path)?;
        let malformed = self.load_document(&document);

        tracing::info!(
            "Loaded {} key mapping(s) from {} ({} malformed row(s))",
            self.entries.len(),
            path.display(),
            malformed
        );

        Ok(malformed)
    }

    /// Replace the table contents with an already parsed document.
    pub fn load_document(&mut self, document: &KeyTableDocument) -> usize {
        self.clear();

        for row in &document.rows {
            if !self.add(row.code, row.key, row.modifiers) {
                tracing::debug!("Ignoring duplicate mapping for code {:#x}", row.code);
            }
        }

        document.malformed
    }

    /// Write the table to `path` in the key-table document format
    pub fn save(&self, path: &Path) -> Result<(), InputError> {
        virtual_input_config::write_key_table(path, &self.rows())?;
        Ok(())
    }

    /// Table contents as document rows, in ascending raw code order
    pub fn rows(&self) -> Vec<KeyRow> {
        self.entries
            .iter()
            .map(|(&code, info)| KeyRow {
                code,
                key: info.code,
                modifiers: info.modifiers,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain the deltas recorded since the last call
    pub fn take_changes(&mut self) -> MapChanges {
        std::mem::take(&mut self.changes)
    }

    /// Tear the table down, returning the pending deltas plus one release per
    /// remaining entry as a single batch.
    pub fn into_release_changes(mut self) -> MapChanges {
        self.clear();
        self.changes
    }

    fn clear(&mut self) {
        for info in std::mem::take(&mut self.entries).into_values() {
            self.record(info.code, -1);
        }
    }

    fn record(&mut self, key: u16, delta: i32) {
        let entry = self.changes.entry(key).or_insert(0);
        *entry += delta;
        if *entry == 0 {
            self.changes.remove(&key);
        }
    }
}
