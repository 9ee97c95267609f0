//! uinput output backend
//!
//! Replays key actions on one virtual keyboard. The keyboard advertises
//! exactly the output codes that some key table can currently produce, plus
//! the six modifier keys, and is rebuilt whenever that set changes.
//!
//! evdev always creates the keyboard through [`UINPUT_NODE`]; the configured
//! locator is only checked for existence when the backend is built.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key};
use virtual_input_config::Modifier;

use super::KeySink;
use crate::action::{key_part, KeyAction};
use crate::error::BackendError;
use crate::keymap::MapChanges;
use crate::lock;
use crate::modifier::modifier_key;

/// Node evdev opens to create the virtual keyboard
pub const UINPUT_NODE: &str = "/dev/uinput";

#[derive(Default)]
struct DeviceState {
    device: Option<VirtualDevice>,
    /// Output code → number of table entries producing it
    references: BTreeMap<u16, u32>,
}

impl DeviceState {
    /// Apply a batch of deltas. Returns whether the advertised key set changed.
    fn apply(&mut self, changes: &MapChanges) -> bool {
        let mut changed = false;

        for (&code, &delta) in changes {
            let current = i64::from(self.references.get(&code).copied().unwrap_or(0));
            let next = current + i64::from(delta);

            if next <= 0 {
                if next < 0 {
                    tracing::warn!("Reference count of key {} dropped below zero", code);
                }
                changed |= self.references.remove(&code).is_some();
            } else {
                let next = u32::try_from(next).unwrap_or(u32::MAX);
                changed |= self.references.insert(code, next).is_none();
            }
        }

        changed
    }

    fn key_set(&self) -> BTreeSet<u16> {
        self.references
            .keys()
            .copied()
            .chain(Modifier::ALL.into_iter().map(modifier_key))
            .collect()
    }
}

/// Virtual keyboard backend
pub struct DeviceBackend {
    name: String,
    state: Mutex<DeviceState>,
}

impl DeviceBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Codes the virtual keyboard advertises
    pub fn advertised(&self) -> BTreeSet<u16> {
        lock(&self.state).key_set()
    }

    fn build(&self, codes: &BTreeSet<u16>) -> Result<VirtualDevice, BackendError> {
        let mut keys = AttributeSet::<Key>::new();
        for &code in codes {
            keys.insert(Key::new(code));
        }

        let open_failed = |source| BackendError::OpenFailed {
            locator: UINPUT_NODE.to_string(),
            source,
        };

        let device = VirtualDeviceBuilder::new()
            .map_err(open_failed)?
            .name(&self.name)
            .with_keys(&keys)
            .map_err(open_failed)?
            .build()
            .map_err(open_failed)?;

        tracing::info!("Created virtual keyboard '{}' with {} key(s)", self.name, codes.len());
        Ok(device)
    }
}

impl KeySink for DeviceBackend {
    fn open(&self) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if state.device.is_none() {
            state.device = Some(self.build(&state.key_set())?);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), BackendError> {
        if lock(&self.state).device.take().is_some() {
            tracing::info!("Destroyed virtual keyboard '{}'", self.name);
        }
        Ok(())
    }

    fn send_key(&self, action: KeyAction, code: u32) -> Result<(), BackendError> {
        let value = match action {
            KeyAction::Released => 0,
            KeyAction::Pressed => 1,
            KeyAction::Repeat => 2,
            // Not a device event
            KeyAction::Completed => return Ok(()),
        };

        let mut state = lock(&self.state);
        let device = state.device.as_mut().ok_or(BackendError::NotOpen)?;

        let key = InputEvent::new(EventType::KEY, key_part(code), value);
        let syn = InputEvent::new(EventType::SYNCHRONIZATION, 0, 0);
        device
            .emit(&[key, syn])
            .map_err(|source| BackendError::SendFailed { action, code, source })
    }

    fn map_changes(&self, changes: &MapChanges) {
        let mut state = lock(&self.state);
        if !state.apply(changes) || state.device.is_none() {
            return;
        }

        // Key capabilities are fixed at creation
        let codes = state.key_set();
        state.device = None;
        match self.build(&codes) {
            Ok(device) => state.device = Some(device),
            Err(e) => tracing::error!("Failed to rebuild virtual keyboard: {}", e),
        }
    }

    fn lookup_changes(&self, _session: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_counting() {
        let mut state = DeviceState::default();

        assert!(state.apply(&MapChanges::from([(30, 2), (31, 1)])));
        assert!(!state.apply(&MapChanges::from([(30, -1)])));
        assert_eq!(state.references.get(&30), Some(&1));

        assert!(state.apply(&MapChanges::from([(30, -1)])));
        assert_eq!(state.references.keys().copied().collect::<Vec<_>>(), vec![31]);
    }

    #[test]
    fn test_counts_beyond_u16() {
        let mut state = DeviceState::default();
        assert!(state.apply(&MapChanges::from([(30, 70_000)])));
        assert!(!state.apply(&MapChanges::from([(30, -69_999)])));
        assert_eq!(state.references.get(&30), Some(&1));
    }

    #[test]
    fn test_underflow_clamps_to_removed() {
        let mut state = DeviceState::default();
        assert!(!state.apply(&MapChanges::from([(5, -1)])));
        assert!(state.references.is_empty());
    }

    #[test]
    fn test_key_set_includes_modifiers() {
        let backend = DeviceBackend::new("test");
        backend.map_changes(&MapChanges::from([(30, 1)]));

        let keys = backend.advertised();
        assert!(keys.contains(&30));
        assert!(keys.contains(&Key::KEY_LEFTSHIFT.code()));
        assert!(keys.contains(&Key::KEY_RIGHTCTRL.code()));
        assert_eq!(keys.len(), 7);
    }

    #[test]
    fn test_send_requires_open_device() {
        let backend = DeviceBackend::new("test");
        assert!(matches!(
            backend.send_key(KeyAction::Pressed, 30),
            Err(BackendError::NotOpen)
        ));
        // Completions never reach the device
        assert!(backend.send_key(KeyAction::Completed, 30).is_ok());
        assert!(backend.close().is_ok());
    }
}
