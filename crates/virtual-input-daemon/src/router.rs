//! Key event routing
//!
//! [`EventRouter`] turns raw key transitions into key actions:
//!
//! ```text
//!  raw (pressed, code, table)
//!          │
//!          ▼
//!   KeyTable lookup ──miss──► dropped (unless the table is pass-through)
//!          │
//!          ▼
//!   ModifierTracker ──edges──► modifier pseudo-key actions
//!          │
//!          ▼
//!   RepeatScheduler arm/reset ──ticks──► REPEAT / COMPLETED
//!          │
//!          ▼
//!   code listeners → wildcard listeners → backend sink
//! ```
//!
//! ## Locking
//!
//! Tables, the default table name, the modifier counts and the tracked pressed
//! key live behind one state lock. Actions are collected while it is held and
//! delivered after it is released, so listeners and the backend may call back
//! into the router. Repeat ticks are delivered from the timer task without
//! taking the state lock.
//!
//! Only one key is tracked at a time. Pressing a second key while the first is
//! still down supersedes it: the first key is released logically and a later
//! physical release of it is ignored.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::runtime::Handle;
use virtual_input_config::ModifierMask;

use crate::action::{composite, KeyAction};
use crate::backend::KeySink;
use crate::error::InputError;
use crate::keymap::{ConversionInfo, KeyTable};
use crate::modifier::{modifier_key, Adjustment, ModifierTracker};
use crate::notify::{KeyFilter, KeyListener, NotificationRegistry};
use crate::post_lookup::PostLookupStore;
use crate::repeat::{RepeatScheduler, RepeatState, RepeatTick, RepeatTiming};
use crate::{lock, read, write};

/// An action waiting for delivery: (action, composite code)
type Emitted = (KeyAction, u32);

/// The key currently held down
#[derive(Debug, Clone, PartialEq, Eq)]
struct PressedKey {
    raw: u32,
    output: u32,
    modifiers: ModifierMask,
    /// Table the press was resolved through
    table: String,
}

#[derive(Debug, Default)]
struct RouterState {
    tables: HashMap<String, KeyTable>,
    default_table: Option<String>,
    modifiers: ModifierTracker,
    pressed: Option<PressedKey>,
}

struct RouterInner {
    state: Mutex<RouterState>,
    listeners: RwLock<NotificationRegistry>,
    sink: Arc<dyn KeySink>,
    repeat: RepeatScheduler,
    post_lookups: Arc<PostLookupStore>,
}

/// The key virtualization engine.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    /// Create a router delivering to `sink`. Repeat timers run on `runtime`.
    pub fn new(runtime: Handle, sink: Arc<dyn KeySink>, post_lookups: Arc<PostLookupStore>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RouterInner>| {
            let weak = weak.clone();
            RouterInner {
                state: Mutex::new(RouterState::default()),
                listeners: RwLock::new(NotificationRegistry::new()),
                sink,
                repeat: RepeatScheduler::new(runtime, move |tick| {
                    if let Some(inner) = weak.upgrade() {
                        inner.repeat_tick(tick);
                    }
                }),
                post_lookups,
            }
        });

        Self { inner }
    }

    // ========================================================================
    // Data plane
    // ========================================================================

    /// Feed one raw key transition.
    ///
    /// `table` selects the key table; `None` uses the default table. Fails
    /// with [`InputError::NoMapping`] if no table can be resolved. The release
    /// of the tracked key never goes through a table, so it completes even if
    /// the table changed while the key was held. A release that drove a
    /// modifier count below zero is still delivered and then reported as
    /// [`InputError::ModifierUnderflow`].
    pub fn key_event(&self, pressed: bool, raw: u32, table: Option<&str>) -> Result<(), InputError> {
        let mut emitted = Vec::new();

        let underflow = {
            let mut state = lock(&self.inner.state);

            if !pressed && state.pressed.as_ref().is_some_and(|key| key.raw == raw) {
                self.inner.release(&mut state, &mut emitted)
            } else {
                let (name, conversion) = resolve(&state, raw, table)?;
                let name = name.to_string();

                match conversion {
                    None => tracing::trace!("No mapping for raw code {:#x}, ignored", raw),
                    Some(conversion) if pressed => {
                        self.inner.press(&mut state, raw, conversion, name, &mut emitted)
                    }
                    Some(_) => tracing::trace!("Release of untracked raw code {:#x} ignored", raw),
                }
                ModifierMask::NONE
            }
        };

        self.inner.deliver(&emitted);

        match underflow.iter().next() {
            Some(modifier) => Err(InputError::ModifierUnderflow { modifier }),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Control plane
    // ========================================================================

    /// Set repeat timing for future presses. `limit == 0` repeats until
    /// release; `start_ms == 0` disables repeat.
    pub fn set_repeat(&self, start_ms: u16, interval_ms: u16, limit: u16) {
        let timing = RepeatTiming::from_millis(start_ms, interval_ms, limit);
        tracing::debug!("Repeat timing set to {:?}", timing);
        self.inner.repeat.configure(timing);
    }

    pub fn repeat_timing(&self) -> RepeatTiming {
        self.inner.repeat.timing()
    }

    pub fn repeat_state(&self) -> RepeatState {
        self.inner.repeat.state()
    }

    /// Designate the default table. An empty name clears the designation.
    pub fn set_default(&self, name: &str) -> Result<(), InputError> {
        let mut state = lock(&self.inner.state);

        if name.is_empty() {
            state.default_table = None;
            return Ok(());
        }

        if !state.tables.contains_key(name) {
            return Err(InputError::UnknownTable {
                name: name.to_string(),
            });
        }

        state.default_table = Some(name.to_string());
        Ok(())
    }

    pub fn default_table(&self) -> Option<String> {
        lock(&self.inner.state).default_table.clone()
    }

    /// Run a mutation against the table `name`, creating it if needed.
    ///
    /// Reference deltas accumulated by the mutation are reported to the
    /// backend as one batch once the state lock is released. A held key the
    /// table no longer produces is released first.
    pub fn update_table<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce(&mut KeyTable) -> R,
    {
        let mut emitted = Vec::new();

        let (result, changes) = {
            let mut state = lock(&self.inner.state);
            let table = state.tables.entry(name.to_string()).or_insert_with(|| {
                tracing::debug!("Created key table '{}'", name);
                KeyTable::new()
            });
            let result = f(table);
            let changes = table.take_changes();

            self.inner.release_stale(&mut state, &mut emitted);
            (result, changes)
        };

        self.inner.deliver(&emitted);
        if !changes.is_empty() {
            self.inner.sink.map_changes(&changes);
        }

        result
    }

    /// Replace the contents of table `name` with the document at `path`.
    /// Returns the number of malformed rows.
    pub fn load_table(&self, name: &str, path: &Path, pass_through: bool) -> Result<usize, InputError> {
        self.update_table(name, |table| {
            table.set_pass_through(pass_through);
            table.load(path)
        })
    }

    /// Destroy table `name`, reporting all of its entries as released in one
    /// batch. A key held through the table is released first. Returns whether
    /// the table existed.
    pub fn clear_table(&self, name: &str) -> bool {
        let mut emitted = Vec::new();

        let changes = {
            let mut state = lock(&self.inner.state);
            let Some(table) = state.tables.remove(name) else {
                return false;
            };

            if state.default_table.as_deref() == Some(name) {
                tracing::info!("Default table '{}' destroyed, no default table set", name);
                state.default_table = None;
            }

            self.inner.release_stale(&mut state, &mut emitted);
            table.into_release_changes()
        };

        self.inner.deliver(&emitted);
        if !changes.is_empty() {
            self.inner.sink.map_changes(&changes);
        }
        true
    }

    /// Names of the existing tables, sorted
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.inner.state).tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Modifiers currently held down
    pub fn held_modifiers(&self) -> ModifierMask {
        lock(&self.inner.state).modifiers.held()
    }

    pub fn register(&self, listener: Arc<dyn KeyListener>, filter: KeyFilter) -> bool {
        write(&self.inner.listeners).register(listener, filter)
    }

    pub fn unregister(&self, listener: &Arc<dyn KeyListener>, filter: KeyFilter) -> bool {
        write(&self.inner.listeners).unregister(listener, filter)
    }

    /// Reload the post-lookup table of `session` from `path` and tell the
    /// backend so live sessions re-resolve it.
    pub fn post_lookup(&self, session: &str, path: &Path) -> Result<usize, InputError> {
        let count = self.inner.post_lookups.reload_from(session, path)?;
        self.inner.sink.lookup_changes(session);
        Ok(count)
    }

    pub fn post_lookups(&self) -> &Arc<PostLookupStore> {
        &self.inner.post_lookups
    }

    /// Cancel any pending repeat. Pending deltas are not reported.
    pub fn shutdown(&self) {
        if let Some(code) = self.inner.repeat.reset() {
            tracing::debug!("Cancelled repeat of {:#x} on shutdown", code);
        }
    }
}

/// Name of the selected table and the translation of `raw` through it, or
/// `None` on a miss
fn resolve<'a>(
    state: &'a RouterState,
    raw: u32,
    table: Option<&'a str>,
) -> Result<(&'a str, Option<Info>), InputError> {
    let name = table.or(state.default_table.as_deref());

    match name.and_then(|name| Some((name, state.tables.get(name)?))) {
        Some((name, key_table)) => Ok((name, translate(key_table, raw))),
        None => Err(InputError::NoMapping {
            table: name.unwrap_or("<default>").to_string(),
        }),
    }
}

fn translate(table: &KeyTable, raw: u32) -> Option<Info> {
    if table.pass_through() {
        return Some(Info {
            output: raw,
            modifiers: ModifierMask::NONE,
        });
    }

    table.lookup(raw).map(Info::from)
}

/// Lookup result in composite form
#[derive(Debug, Clone, Copy)]
struct Info {
    output: u32,
    modifiers: ModifierMask,
}

impl From<ConversionInfo> for Info {
    fn from(info: ConversionInfo) -> Self {
        Self {
            output: composite(info.code, info.modifiers),
            modifiers: info.modifiers,
        }
    }
}

impl RouterInner {
    fn press(
        &self,
        state: &mut RouterState,
        raw: u32,
        info: Info,
        table: String,
        emitted: &mut Vec<Emitted>,
    ) {
        let adjustment = state.modifiers.adjust(info.modifiers, true);
        push_edges(adjustment, KeyAction::Pressed, emitted);

        if let Some(code) = self.repeat.reset() {
            emitted.push((KeyAction::Completed, code));
        }

        if let Some(previous) = state.pressed.take() {
            tracing::debug!(
                "Raw code {:#x} superseded by {:#x}",
                previous.raw,
                raw
            );
            let adjustment = state.modifiers.adjust(previous.modifiers, false);
            emitted.push((KeyAction::Released, previous.output));
            push_edges(adjustment, KeyAction::Released, emitted);
        }

        emitted.push((KeyAction::Pressed, info.output));

        if let Err(e) = self.repeat.arm(info.output) {
            tracing::warn!("Could not arm repeat for {:#x}: {}", info.output, e);
        }

        state.pressed = Some(PressedKey {
            raw,
            output: info.output,
            modifiers: info.modifiers,
            table,
        });
    }

    /// Release the tracked key. Returns the modifiers that underflowed.
    fn release(&self, state: &mut RouterState, emitted: &mut Vec<Emitted>) -> ModifierMask {
        let Some(pressed) = state.pressed.take() else {
            return ModifierMask::NONE;
        };

        if let Some(code) = self.repeat.reset() {
            emitted.push((KeyAction::Completed, code));
        }

        let adjustment = state.modifiers.adjust(pressed.modifiers, false);
        if !adjustment.underflow.is_empty() {
            tracing::warn!(
                "Modifier underflow ({}) releasing {:#x}",
                adjustment.underflow,
                pressed.output
            );
        }

        emitted.push((KeyAction::Released, pressed.output));
        push_edges(adjustment, KeyAction::Released, emitted);

        adjustment.underflow
    }

    /// Release the tracked key if its table is gone or no longer produces it
    fn release_stale(&self, state: &mut RouterState, emitted: &mut Vec<Emitted>) {
        let Some(pressed) = &state.pressed else {
            return;
        };

        let still_mapped = state
            .tables
            .get(&pressed.table)
            .and_then(|table| translate(table, pressed.raw))
            .is_some_and(|info| info.output == pressed.output);

        if !still_mapped {
            tracing::debug!(
                "Table '{}' no longer maps held raw code {:#x}, releasing",
                pressed.table,
                pressed.raw
            );
            self.release(state, emitted);
        }
    }

    fn repeat_tick(&self, tick: RepeatTick) {
        match tick {
            RepeatTick::Repeat(code) => self.deliver(&[(KeyAction::Repeat, code)]),
            // The tracked key stays down; its release still has to balance the
            // modifier counts
            RepeatTick::Last(code) => {
                self.deliver(&[(KeyAction::Repeat, code), (KeyAction::Completed, code)])
            }
        }
    }

    fn deliver(&self, emitted: &[Emitted]) {
        for &(action, code) in emitted {
            tracing::debug!("{:?} {:#x}", action, code);

            let listeners = read(&self.listeners).listeners_for(code);
            for listener in listeners {
                if let Err(e) = listener.dispatch(action, code) {
                    tracing::warn!("Listener failed on {:?} {:#x}: {:#}", action, code, e);
                }
            }

            if let Err(e) = self.sink.send_key(action, code) {
                tracing::warn!("Backend failed on {:?} {:#x}: {}", action, code, e);
            }
        }
    }
}

/// Queue one modifier pseudo-key action per edge
fn push_edges(adjustment: Adjustment, action: KeyAction, emitted: &mut Vec<Emitted>) {
    for modifier in adjustment.edges.iter() {
        emitted.push((action, u32::from(modifier_key(modifier))));
    }
}
