//! Output backends
//!
//! The router hands every emitted action to exactly one [`KeySink`]. Two
//! implementations exist: [`DeviceBackend`] replays actions on a uinput
//! keyboard, [`SessionBackend`] relays them to remote sessions over a Unix
//! socket.

mod device;
mod session;

use std::path::Path;
use std::sync::Arc;

use tokio::runtime::Handle;
use virtual_input_config::BackendKind;

use crate::action::KeyAction;
use crate::error::BackendError;
use crate::keymap::MapChanges;
use crate::post_lookup::PostLookupStore;

pub use device::{DeviceBackend, UINPUT_NODE};
pub use session::{SessionBackend, MAX_SESSIONS};

/// Capability interface of an output backend.
///
/// Methods are synchronous and must not block on I/O; they are called from
/// the input path and from the repeat timer.
pub trait KeySink: Send + Sync {
    fn open(&self) -> Result<(), BackendError>;

    fn close(&self) -> Result<(), BackendError>;

    /// Deliver one action. `code` is a composite key.
    fn send_key(&self, action: KeyAction, code: u32) -> Result<(), BackendError>;

    /// Reference-count deltas of output codes after a table change
    fn map_changes(&self, changes: &MapChanges);

    /// The post-lookup table of `session` was replaced or removed
    fn lookup_changes(&self, session: &str);
}

/// Build the backend selected by `kind`.
///
/// The device backend requires `locator` to exist, but the keyboard itself is
/// always created through [`UINPUT_NODE`]. The session backend listens on
/// `locator`.
pub fn create(
    kind: BackendKind,
    locator: &Path,
    runtime: Handle,
    post_lookups: Arc<PostLookupStore>,
) -> Result<Arc<dyn KeySink>, BackendError> {
    match kind {
        BackendKind::Device => {
            if !locator.exists() {
                return Err(BackendError::OpenFailed {
                    locator: locator.display().to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "uinput node does not exist",
                    ),
                });
            }
            if locator != Path::new(UINPUT_NODE) {
                tracing::warn!(
                    "Device locator {} is only checked for existence, the keyboard is created through {}",
                    locator.display(),
                    UINPUT_NODE
                );
            }
            Ok(Arc::new(DeviceBackend::new("virtual-input")))
        }
        BackendKind::Virtual => Ok(Arc::new(SessionBackend::new(
            locator,
            runtime,
            post_lookups,
        ))),
    }
}
