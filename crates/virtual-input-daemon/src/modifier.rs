//! Reference counting for the six modifier keys
//!
//! Several physical keys can map to the same logical modifier (two shift keys
//! on one board, rollover duplicates from a remote). Each modifier keeps a
//! saturating count of the pressed keys that currently hold it, and only the
//! transitions across zero ("edges") are reported, so aliased keys collapse
//! into a single modifier press and a single modifier release.

use evdev::Key;
use virtual_input_config::{Modifier, ModifierMask};

/// Highest value a modifier count can reach.
pub const MAX_COUNT: u8 = 15;

/// Result of one [`ModifierTracker::adjust`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Adjustment {
    /// Modifiers whose count crossed zero (0→1 on press, 1→0 on release)
    pub edges: ModifierMask,
    /// Modifiers released while their count was already zero
    pub underflow: ModifierMask,
}

/// Saturating reference counts, one per [`Modifier`], each in `0..=15`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifierTracker {
    counts: [u8; 6],
}

impl ModifierTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment (press) or decrement (release) the count of every modifier in
    /// `mask`.
    ///
    /// Increments saturate at [`MAX_COUNT`]. A decrement of a zero count leaves
    /// it at zero and is reported in [`Adjustment::underflow`].
    pub fn adjust(&mut self, mask: ModifierMask, pressed: bool) -> Adjustment {
        let mut result = Adjustment::default();

        for modifier in mask.iter() {
            let count = &mut self.counts[modifier.index()];

            if pressed {
                if *count == 0 {
                    result.edges.insert(modifier);
                }
                *count = count.saturating_add(1).min(MAX_COUNT);
            } else {
                match *count {
                    0 => result.underflow.insert(modifier),
                    1 => {
                        *count = 0;
                        result.edges.insert(modifier);
                    }
                    _ => *count -= 1,
                }
            }
        }

        result
    }

    /// Current count of one modifier
    pub fn count(&self, modifier: Modifier) -> u8 {
        self.counts[modifier.index()]
    }

    /// Modifiers with a non-zero count
    pub fn held(&self) -> ModifierMask {
        Modifier::ALL
            .into_iter()
            .filter(|m| self.count(*m) > 0)
            .collect()
    }
}

/// Output code emitted for a modifier edge
pub fn modifier_key(modifier: Modifier) -> u16 {
    let key = match modifier {
        Modifier::LeftShift => Key::KEY_LEFTSHIFT,
        Modifier::RightShift => Key::KEY_RIGHTSHIFT,
        Modifier::LeftAlt => Key::KEY_LEFTALT,
        Modifier::RightAlt => Key::KEY_RIGHTALT,
        Modifier::LeftCtrl => Key::KEY_LEFTCTRL,
        Modifier::RightCtrl => Key::KEY_RIGHTCTRL,
    };
    key.code()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shift() -> ModifierMask {
        Modifier::LeftShift.into()
    }

    #[test]
    fn test_press_reports_edge_once() {
        let mut tracker = ModifierTracker::new();

        let first = tracker.adjust(shift(), true);
        assert_eq!(first.edges, shift());

        let second = tracker.adjust(shift(), true);
        assert!(second.edges.is_empty(), "aliased press must not re-trigger");
        assert_eq!(tracker.count(Modifier::LeftShift), 2);
    }

    #[test]
    fn test_release_reports_edge_at_zero() {
        let mut tracker = ModifierTracker::new();
        tracker.adjust(shift(), true);
        tracker.adjust(shift(), true);

        assert!(tracker.adjust(shift(), false).edges.is_empty());
        assert_eq!(tracker.adjust(shift(), false).edges, shift());
        assert_eq!(tracker.count(Modifier::LeftShift), 0);
    }

    #[test]
    fn test_saturates_at_fifteen() {
        let mut tracker = ModifierTracker::new();
        for _ in 0..20 {
            tracker.adjust(shift(), true);
        }
        assert_eq!(tracker.count(Modifier::LeftShift), MAX_COUNT);

        for _ in 0..14 {
            assert!(tracker.adjust(shift(), false).edges.is_empty());
        }
        assert_eq!(tracker.adjust(shift(), false).edges, shift());
    }

    #[test]
    fn test_underflow_is_reported_and_stays_zero() {
        let mut tracker = ModifierTracker::new();
        let result = tracker.adjust(shift(), false);

        assert_eq!(result.underflow, shift());
        assert!(result.edges.is_empty());
        assert_eq!(tracker.count(Modifier::LeftShift), 0);
    }

    #[test]
    fn test_counters_are_independent() {
        let mut tracker = ModifierTracker::new();
        let mask: ModifierMask = [Modifier::LeftCtrl, Modifier::RightAlt]
            .into_iter()
            .collect();

        assert_eq!(tracker.adjust(mask, true).edges, mask);
        assert_eq!(tracker.held(), mask);
        assert_eq!(tracker.count(Modifier::LeftShift), 0);

        let release = tracker.adjust(Modifier::LeftCtrl.into(), false);
        assert_eq!(release.edges, Modifier::LeftCtrl.into());
        assert_eq!(tracker.held(), Modifier::RightAlt.into());
    }

    #[test]
    fn test_modifier_keys_are_evdev_codes() {
        assert_eq!(modifier_key(Modifier::LeftShift), 42);
        assert_eq!(modifier_key(Modifier::RightCtrl), 97);
    }
}
