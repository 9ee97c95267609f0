//! Error types for the key virtualization engine

use thiserror::Error;

use crate::action::KeyAction;

/// Errors reported by the engine to its callers.
///
/// Precondition violations (double arm, modifier underflow) are reported here
/// instead of aborting, so one misbehaving table or session cannot take down
/// unrelated input handling.
#[derive(Debug, Error)]
pub enum InputError {
    /// No table was named and no default table is set
    #[error("no mapping: table '{table}' is not available")]
    NoMapping { table: String },

    /// A table name that is not loaded
    #[error("unknown key table '{name}'")]
    UnknownTable { name: String },

    /// The repeat slot was armed while already holding a code
    #[error("repeat slot already armed with code {armed:#x}")]
    RepeatAlreadyArmed { armed: u32 },

    /// A modifier was released more often than it was pressed
    #[error("modifier {modifier} released while its count is zero")]
    ModifierUnderflow {
        modifier: virtual_input_config::Modifier,
    },

    /// A configuration document could not be read
    #[error(transparent)]
    Config(#[from] virtual_input_config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend rejected an operation
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Failure status of a [`crate::backend::KeySink`] operation
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend is not open")]
    NotOpen,

    #[error("failed to open backend at {locator}: {source}")]
    OpenFailed {
        locator: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to deliver {action:?} for code {code:#x}: {source}")]
    SendFailed {
        action: KeyAction,
        code: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("backend IO error: {0}")]
    Io(#[from] std::io::Error),
}
