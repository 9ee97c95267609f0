//! Per-session remap tables applied after translation
//!
//! Each table maps a composite key (`code | mods << 16`) to a replacement
//! composite key and belongs to one session name. A table only exists while it
//! has entries. Tables are shared as `Arc` handles: a reload swaps in a new
//! `Arc` and sessions holding the old one keep a consistent (if stale) view
//! until they re-resolve.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use virtual_input_config::PostLookupDocument;

use crate::action::composite;
use crate::error::InputError;
use crate::lock;

/// Composite key → composite key
pub type PostLookupEntries = HashMap<u32, u32>;

/// Build the entries of one post-lookup document.
///
/// The replacement carries the *input* modifier mask, not the one written on
/// the `out` side. Existing remote configurations depend on that, so `out`
/// modifiers are parsed but ignored.
pub fn build_entries(document: &PostLookupDocument) -> PostLookupEntries {
    let mut entries = PostLookupEntries::new();

    for conversion in &document.conversions {
        let from = composite(conversion.input.code, conversion.input.mods);
        let to = composite(conversion.output.code, conversion.input.mods);

        if !conversion.output.mods.is_empty() && conversion.output.mods != conversion.input.mods {
            tracing::debug!(
                "Conversion {:#x}: out modifiers {} ignored, keeping {}",
                from,
                conversion.output.mods,
                conversion.input.mods
            );
        }

        entries.entry(from).or_insert(to);
    }

    entries
}

/// Post-lookup tables of every session, behind one coarse lock
#[derive(Debug, Default)]
pub struct PostLookupStore {
    tables: Mutex<HashMap<String, Arc<PostLookupEntries>>>,
}

impl PostLookupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table of `session` with the conversions of `document`.
    ///
    /// The swap is whole-table. An empty result removes the session's table.
    /// Returns the number of entries now bound to the session. The caller is
    /// responsible for telling live sessions to re-resolve; the router does
    /// this through the backend after the lock is released.
    pub fn reload(&self, session: &str, document: &PostLookupDocument) -> usize {
        let entries = build_entries(document);
        let count = entries.len();

        let mut tables = lock(&self.tables);
        if entries.is_empty() {
            if tables.remove(session).is_some() {
                tracing::info!("Removed post-lookup table for session '{}'", session);
            }
        } else {
            tables.insert(session.to_string(), Arc::new(entries));
            tracing::info!(
                "Post-lookup table for session '{}' now has {} entr{}",
                session,
                count,
                if count == 1 { "y" } else { "ies" }
            );
        }

        count
    }

    /// Read a post-lookup document from `path` and [`reload`](Self::reload) it
    pub fn reload_from(&self, session: &str, path: &Path) -> Result<usize, InputError> {
        let document = virtual_input_config::parse_post_lookup(path)?;
        if document.skipped > 0 {
            tracing::warn!(
                "Skipped {} incomplete conversion(s) in {}",
                document.skipped,
                path.display()
            );
        }
        Ok(self.reload(session, &document))
    }

    /// Current table of `session`, if it has one
    pub fn find(&self, session: &str) -> Option<Arc<PostLookupEntries>> {
        lock(&self.tables).get(session).cloned()
    }

    /// Names of sessions with a table
    pub fn sessions(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.tables).keys().cloned().collect();
        names.sort();
        names
    }
}
