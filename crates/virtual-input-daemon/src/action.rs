//! Key actions and composite codes shared by every delivery path

use serde::{Deserialize, Serialize};
use virtual_input_config::ModifierMask;

/// What happened to a key.
///
/// The discriminants match the numeric values used on the session wire and
/// the evdev value convention for the first three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum KeyAction {
    Released = 0,
    Pressed = 1,
    Repeat = 2,
    /// The repeat sequence for a key ended
    Completed = 3,
}

/// Pack an output code and its modifier mask into one composite key.
///
/// Post-lookup tables are keyed by this value and remote sessions receive it
/// as the `code` of a key message.
pub const fn composite(code: u16, modifiers: ModifierMask) -> u32 {
    (code as u32) | ((modifiers.bits() as u32) << 16)
}

/// Output code part of a composite key
pub const fn key_part(composite: u32) -> u16 {
    (composite & 0xFFFF) as u16
}

/// Modifier part of a composite key
pub const fn modifier_part(composite: u32) -> ModifierMask {
    ModifierMask::from_bits((composite >> 16) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtual_input_config::Modifier;

    #[test]
    fn test_composite_packs_modifiers_high() {
        let code = composite(10, Modifier::LeftShift.into());
        assert_eq!(code, 0x0001_000a);
        assert_eq!(key_part(code), 10);
        assert_eq!(modifier_part(code), Modifier::LeftShift.into());
    }

    #[test]
    fn test_action_wire_names() {
        assert_eq!(
            serde_json::to_string(&KeyAction::Completed).unwrap(),
            r#""completed""#
        );
        assert_eq!(KeyAction::Repeat as u8, 2);
    }
}
