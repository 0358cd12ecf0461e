//! Key bindings: raw key code → note or control action

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::KeyMapConfig;

/// Control actions a key can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// All notes off on the current channel
    Panic,
    /// Transpose, channel and program back to zero
    Reset,
    OctaveUp,
    OctaveDown,
    SemitoneUp,
    SemitoneDown,
    ChannelUp,
    ChannelDown,
    ProgramUp,
    ProgramDown,
    /// Momentary sustain pedal (CC 64), the only action with a release effect
    Sustain,
    // Names from older key maps; accepted so those files still load, no effect
    OctaveAdd,
    OctaveDel,
    PitchControl,
    PitchControlToggle,
}

impl ControlAction {
    /// Accepted in key maps but does nothing
    pub fn is_inert(&self) -> bool {
        matches!(
            self,
            ControlAction::OctaveAdd
                | ControlAction::OctaveDel
                | ControlAction::PitchControl
                | ControlAction::PitchControlToggle
        )
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlAction::Panic => "panic",
            ControlAction::Reset => "reset",
            ControlAction::OctaveUp => "octave_up",
            ControlAction::OctaveDown => "octave_down",
            ControlAction::SemitoneUp => "semitone_up",
            ControlAction::SemitoneDown => "semitone_down",
            ControlAction::ChannelUp => "channel_up",
            ControlAction::ChannelDown => "channel_down",
            ControlAction::ProgramUp => "program_up",
            ControlAction::ProgramDown => "program_down",
            ControlAction::Sustain => "sustain",
            ControlAction::OctaveAdd => "octave_add",
            ControlAction::OctaveDel => "octave_del",
            ControlAction::PitchControl => "pitch_control",
            ControlAction::PitchControlToggle => "pitch_control_toggle",
        };
        f.write_str(name)
    }
}

/// What a key code does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBinding {
    Note(u8),
    Control(ControlAction),
}

/// Compiled lookup table for one device
#[derive(Debug, Clone, Default)]
pub struct KeyMap {
    bindings: HashMap<u8, KeyBinding>,
}

impl KeyMap {
    /// Build from a key map file; a code bound both ways keeps the control
    pub fn from_config(config: &KeyMapConfig) -> Self {
        let mut bindings = HashMap::with_capacity(config.notes.len() + config.control.len());
        for (&code, &note) in &config.notes {
            bindings.insert(code, KeyBinding::Note(note));
        }
        for (&code, &action) in &config.control {
            bindings.insert(code, KeyBinding::Control(action));
        }
        Self { bindings }
    }

    pub fn get(&self, code: u8) -> Option<KeyBinding> {
        self.bindings.get(&code).copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl FromIterator<(u8, KeyBinding)> for KeyMap {
    fn from_iter<I: IntoIterator<Item = (u8, KeyBinding)>>(iter: I) -> Self {
        Self {
            bindings: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_names_round_trip_through_yaml() {
        let action: ControlAction = serde_yaml::from_str("octave_up").unwrap();
        assert_eq!(action, ControlAction::OctaveUp);
        assert_eq!(action.to_string(), "octave_up");

        assert!(serde_yaml::from_str::<ControlAction>("octave_sideways").is_err());
    }

    #[test]
    fn test_legacy_names_load_as_inert_actions() {
        let config: KeyMapConfig = serde_yaml::from_str(
            r#"
identification:
  real_name: "Old Map"
control:
  78: octave_add
  74: octave_del
  69: pitch_control_toggle
"#,
        )
        .unwrap();

        let map = KeyMap::from_config(&config);
        assert_eq!(map.get(78), Some(KeyBinding::Control(ControlAction::OctaveAdd)));
        assert!(matches!(map.get(69), Some(KeyBinding::Control(action)) if action.is_inert()));
        assert_eq!(ControlAction::OctaveDel.to_string(), "octave_del");
        assert!(!ControlAction::Sustain.is_inert());
    }

    #[test]
    fn test_control_wins_over_note_on_same_code() {
        let config: KeyMapConfig = serde_yaml::from_str(
            r#"
identification:
  real_name: "Test"
notes:
  16: 60
control:
  16: panic
"#,
        )
        .unwrap();

        let map = KeyMap::from_config(&config);
        assert_eq!(map.get(16), Some(KeyBinding::Control(ControlAction::Panic)));
        assert_eq!(map.len(), 1);
    }
}
