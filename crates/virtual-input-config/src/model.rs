//! Configuration data model

use std::fmt;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub global: GlobalConfig,
    pub tables: Vec<TableConfig>,
    pub sources: Vec<SourceConfig>,
    pub post_lookups: Vec<PostLookupConfig>,
}

/// Global settings
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub log_level: LogLevel,
    pub backend: BackendKind,
    /// Session socket path for [`BackendKind::Virtual`], uinput node for
    /// [`BackendKind::Device`].
    pub locator: PathBuf,
    pub repeat: RepeatConfig,
    pub default_table: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            backend: BackendKind::Virtual,
            locator: PathBuf::from("/tmp/keyhandler"),
            repeat: RepeatConfig::default(),
            default_table: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive usable with `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Which key sink the daemon drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Remote sessions over a Unix socket
    #[default]
    Virtual,
    /// Local uinput virtual keyboard
    Device,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "virtual" | "ipc" => Ok(Self::Virtual),
            "device" | "uinput" => Ok(Self::Device),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Software key-repeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatConfig {
    /// Delay before the first repeat, in milliseconds. Zero disables repeat.
    pub start_ms: u16,
    /// Delay between repeats, in milliseconds.
    pub interval_ms: u16,
    /// Number of repeats before the sequence completes on its own. Zero means
    /// the key repeats until it is released.
    pub limit: u16,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            start_ms: 500,
            interval_ms: 100,
            limit: 0,
        }
    }
}

/// A named key table and the document it is loaded from
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub name: String,
    pub path: PathBuf,
    pub pass_through: bool,
}

/// A physical input device feeding the engine
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub path: PathBuf,
    /// Table used for lookups; the default table when unset
    pub table: Option<String>,
    pub grab: bool,
}

/// A per-session remap document
#[derive(Debug, Clone)]
pub struct PostLookupConfig {
    pub session: String,
    pub path: PathBuf,
}

/// One of the six tracked modifier keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modifier {
    LeftShift,
    RightShift,
    LeftAlt,
    RightAlt,
    LeftCtrl,
    RightCtrl,
}

impl Modifier {
    pub const ALL: [Modifier; 6] = [
        Modifier::LeftShift,
        Modifier::RightShift,
        Modifier::LeftAlt,
        Modifier::RightAlt,
        Modifier::LeftCtrl,
        Modifier::RightCtrl,
    ];

    /// Bit of this modifier inside a [`ModifierMask`].
    pub const fn bit(self) -> u16 {
        match self {
            Modifier::LeftShift => 0x01,
            Modifier::RightShift => 0x02,
            Modifier::LeftAlt => 0x04,
            Modifier::RightAlt => 0x08,
            Modifier::LeftCtrl => 0x10,
            Modifier::RightCtrl => 0x20,
        }
    }

    /// Position in [`Modifier::ALL`]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Document name (`LEFTSHIFT`, ...)
    pub const fn name(self) -> &'static str {
        match self {
            Modifier::LeftShift => "LEFTSHIFT",
            Modifier::RightShift => "RIGHTSHIFT",
            Modifier::LeftAlt => "LEFTALT",
            Modifier::RightAlt => "RIGHTALT",
            Modifier::LeftCtrl => "LEFTCTRL",
            Modifier::RightCtrl => "RIGHTCTRL",
        }
    }

    /// Parse a document name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "LEFTSHIFT" => Some(Modifier::LeftShift),
            "RIGHTSHIFT" => Some(Modifier::RightShift),
            "LEFTALT" => Some(Modifier::LeftAlt),
            "RIGHTALT" => Some(Modifier::RightAlt),
            "LEFTCTRL" => Some(Modifier::LeftCtrl),
            "RIGHTCTRL" => Some(Modifier::RightCtrl),
            _ => None,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 16-bit set of [`Modifier`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModifierMask(u16);

impl ModifierMask {
    pub const NONE: ModifierMask = ModifierMask(0);

    /// Build a mask from raw bits. Bits outside the six modifiers are dropped.
    pub const fn from_bits(bits: u16) -> Self {
        ModifierMask(bits & 0x3F)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, modifier: Modifier) -> bool {
        self.0 & modifier.bit() != 0
    }

    pub fn insert(&mut self, modifier: Modifier) {
        self.0 |= modifier.bit();
    }

    /// Modifiers in this mask, in [`Modifier::ALL`] order.
    pub fn iter(self) -> impl Iterator<Item = Modifier> {
        Modifier::ALL.into_iter().filter(move |m| self.contains(*m))
    }
}

impl From<Modifier> for ModifierMask {
    fn from(modifier: Modifier) -> Self {
        ModifierMask(modifier.bit())
    }
}

impl FromIterator<Modifier> for ModifierMask {
    fn from_iter<I: IntoIterator<Item = Modifier>>(iter: I) -> Self {
        let mut mask = ModifierMask::NONE;
        for modifier in iter {
            mask.insert(modifier);
        }
        mask
    }
}

impl fmt::Display for ModifierMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.iter().map(Modifier::name).collect();
        write!(f, "{}", names.join("+"))
    }
}

/// One row of a key-table document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRow {
    /// Raw scan code from the input source
    pub code: u32,
    /// Logical output code
    pub key: u16,
    pub modifiers: ModifierMask,
}

/// Parsed key-table document.
///
/// Malformed rows do not fail the parse; they are only counted.
#[derive(Debug, Clone, Default)]
pub struct KeyTableDocument {
    pub rows: Vec<KeyRow>,
    pub malformed: usize,
}

/// One side of a post-lookup conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    pub code: u16,
    pub mods: ModifierMask,
}

/// A single post-lookup conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conversion {
    pub input: KeySpec,
    pub output: KeySpec,
}

/// Parsed post-lookup document, in document order
#[derive(Debug, Clone, Default)]
pub struct PostLookupDocument {
    pub conversions: Vec<Conversion>,
    pub skipped: usize,
}
