//! Translation engine
//!
//! One engine per attached keyboard. It turns raw key transitions into MIDI
//! messages using the device's key map, and keeps the per-device musical
//! state: channel, transpose, program and the press ledger that pairs every
//! Note-Off with the Note-On it ends.
//!
//! The engine is synchronous and owned by its device worker; nothing else
//! touches it.

pub mod binding;
pub mod ledger;
pub mod modifier;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::{DuplicatePolicy, KeyMapConfig};
use crate::input::RawKeyEvent;
use crate::midi::{MidiMessage, CC_SUSTAIN};

pub use binding::{ControlAction, KeyBinding, KeyMap};
pub use ledger::{PressLedger, Sounding};
pub use modifier::{Modifier, ParallelModifier};

/// Humanized velocity range used when a key map has no fixed velocity
pub const RANDOM_VELOCITY: std::ops::RangeInclusive<u8> = 64..=126;

/// Read-only view of an engine's state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub channel: u8,
    pub program: u8,
    pub transpose: i32,
    pub octave: i32,
    pub active_keys: usize,
}

pub struct TranslationEngine {
    name: String,
    keymap: KeyMap,
    policy: DuplicatePolicy,
    velocity: Option<u8>,
    rng: SmallRng,
    channel: u8,
    transpose: i32,
    program: u8,
    ledger: PressLedger,
    modifiers: Vec<Box<dyn Modifier>>,
    /// Notes of the press being handled (bound note first, then derived ones)
    chord: Vec<u8>,
}

impl TranslationEngine {
    /// Engine for the device `name` using `config`'s bindings and options
    pub fn new(name: impl Into<String>, config: &KeyMapConfig) -> Self {
        let options = &config.options;
        let mut engine = Self::with_keymap(name, KeyMap::from_config(config), options.midi_jam_mode)
            .with_velocity(options.velocity);
        if !options.parallel.is_empty() {
            let parallel = ParallelModifier::new(options.parallel.clone());
            engine = engine.with_modifier(Box::new(parallel));
        }
        engine
    }

    /// Engine with explicit bindings and humanized velocity
    pub fn with_keymap(name: impl Into<String>, keymap: KeyMap, policy: DuplicatePolicy) -> Self {
        Self {
            name: name.into(),
            keymap,
            policy,
            velocity: None,
            rng: SmallRng::from_entropy(),
            channel: 0,
            transpose: 0,
            program: 0,
            ledger: PressLedger::new(),
            modifiers: Vec::new(),
            chord: Vec::with_capacity(4),
        }
    }

    pub fn with_velocity(mut self, velocity: Option<u8>) -> Self {
        self.velocity = velocity.map(|v| v.min(127));
        self
    }

    pub fn with_modifier(mut self, modifier: Box<dyn Modifier>) -> Self {
        debug!("{}: modifier '{}' enabled", self.name, modifier.name());
        self.modifiers.push(modifier);
        self
    }

    /// Process one key transition, appending emitted messages to `out`
    pub fn handle(&mut self, event: &RawKeyEvent, out: &mut Vec<MidiMessage>) {
        match self.keymap.get(event.code) {
            None => debug!("{}: unbound key code {}", self.name, event.code),
            Some(KeyBinding::Note(note)) => {
                if event.released {
                    self.release_note(event.code, note, out)
                } else {
                    self.press_note(event.code, note, out)
                }
            }
            Some(KeyBinding::Control(action)) => {
                if event.released {
                    self.release_control(action, out)
                } else {
                    self.press_control(action, out)
                }
            }
        }
    }

    /// Final all-notes-off for the current channel; the ledger is discarded
    pub fn close(&mut self) -> MidiMessage {
        self.ledger.clear();
        MidiMessage::all_notes_off(self.channel)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            channel: self.channel,
            program: self.program,
            transpose: self.transpose,
            octave: self.transpose.div_euclid(12),
            active_keys: self.ledger.active_keys(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn transpose(&self) -> i32 {
        self.transpose
    }

    pub fn program(&self) -> u8 {
        self.program
    }

    pub fn ledger(&self) -> &PressLedger {
        &self.ledger
    }

    /// Bound note shifted by the current transpose, wrapped into 0..=127
    pub fn emitted_note(&self, bound: u8) -> u8 {
        // rem_euclid(128) always fits a u8
        i32::from(bound).saturating_add(self.transpose).rem_euclid(128) as u8
    }

    fn press_note(&mut self, code: u8, bound: u8, out: &mut Vec<MidiMessage>) {
        let channel = self.channel;
        let note = self.emitted_note(bound);

        let mut chord = std::mem::take(&mut self.chord);
        chord.clear();
        chord.push(note);
        for modifier in self.modifiers.iter_mut() {
            modifier.derive(note, &mut chord);
        }
        let velocity = self.next_velocity();

        for (index, &note) in chord.iter().enumerate() {
            if chord[..index].contains(&note) {
                continue;
            }
            let suppressed = match self.policy {
                DuplicatePolicy::Always => false,
                DuplicatePolicy::Never | DuplicatePolicy::NewPressesOnly => {
                    self.ledger.is_held(channel, note)
                }
            };

            if suppressed {
                trace!("{}: note {} already sounding on channel {}", self.name, note, channel);
            } else {
                out.push(MidiMessage::NoteOn { channel, note, velocity });
            }
            self.ledger.record(code, Sounding { channel, note });
        }

        self.chord = chord;
    }

    fn release_note(&mut self, code: u8, bound: u8, out: &mut Vec<MidiMessage>) {
        let Some(entries) = self.ledger.take(code) else {
            debug!(
                "{}: release of key {} (note {}) without press, ignoring",
                self.name, code, bound
            );
            return;
        };

        let mut released: Vec<(u8, u8)> = Vec::with_capacity(entries.len());
        for Sounding { channel, note } in entries {
            let send = match self.policy {
                DuplicatePolicy::Always => true,
                DuplicatePolicy::Never | DuplicatePolicy::NewPressesOnly => {
                    !self.ledger.is_held(channel, note) && !released.contains(&(channel, note))
                }
            };
            if send {
                released.push((channel, note));
                out.push(MidiMessage::NoteOff { channel, note, velocity: 0 });
            } else {
                trace!("{}: note {} still held on channel {}", self.name, note, channel);
            }
        }
    }

    fn press_control(&mut self, action: ControlAction, out: &mut Vec<MidiMessage>) {
        if action.is_inert() {
            debug!("{}: control '{}' has no effect", self.name, action);
            return;
        }
        match action {
            ControlAction::Panic => out.push(MidiMessage::all_notes_off(self.channel)),
            ControlAction::Reset => {
                self.transpose = 0;
                self.channel = 0;
                self.program = 0;
            }
            ControlAction::OctaveUp => self.transpose = self.transpose.saturating_add(12),
            ControlAction::OctaveDown => self.transpose = self.transpose.saturating_sub(12),
            ControlAction::SemitoneUp => self.transpose = self.transpose.saturating_add(1),
            ControlAction::SemitoneDown => self.transpose = self.transpose.saturating_sub(1),
            ControlAction::ChannelUp => self.channel = (self.channel + 1) % 16,
            ControlAction::ChannelDown => self.channel = (self.channel + 15) % 16,
            ControlAction::ProgramUp => {
                self.program = (self.program + 1).min(127);
                out.push(self.program_change());
            }
            ControlAction::ProgramDown => {
                self.program = self.program.saturating_sub(1);
                out.push(self.program_change());
            }
            ControlAction::Sustain => out.push(MidiMessage::ControlChange {
                channel: self.channel,
                cc: CC_SUSTAIN,
                value: 127,
            }),
            ControlAction::OctaveAdd
            | ControlAction::OctaveDel
            | ControlAction::PitchControl
            | ControlAction::PitchControlToggle => {}
        }
        debug!(
            "{}: {} → channel {}, transpose {}, program {}",
            self.name, action, self.channel, self.transpose, self.program
        );
    }

    fn release_control(&mut self, action: ControlAction, out: &mut Vec<MidiMessage>) {
        if action == ControlAction::Sustain {
            out.push(MidiMessage::ControlChange {
                channel: self.channel,
                cc: CC_SUSTAIN,
                value: 0,
            });
        }
    }

    fn program_change(&self) -> MidiMessage {
        MidiMessage::ProgramChange { channel: self.channel, program: self.program }
    }

    fn next_velocity(&mut self) -> u8 {
        match self.velocity {
            Some(velocity) => velocity,
            None => self.rng.gen_range(RANDOM_VELOCITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::DeviceIdentity;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const DEVICE: DeviceIdentity = DeviceIdentity { bus: 3, vendor: 1, product: 2, version: 3 };

    fn press(code: u8) -> RawKeyEvent {
        RawKeyEvent { device: DEVICE, code, released: false }
    }

    fn release(code: u8) -> RawKeyEvent {
        RawKeyEvent { device: DEVICE, code, released: true }
    }

    fn engine(bindings: &[(u8, KeyBinding)], policy: DuplicatePolicy) -> TranslationEngine {
        TranslationEngine::with_keymap("test", bindings.iter().copied().collect(), policy)
            .with_velocity(Some(100))
    }

    fn run(engine: &mut TranslationEngine, events: &[RawKeyEvent]) -> Vec<MidiMessage> {
        let mut out = Vec::new();
        for event in events {
            engine.handle(event, &mut out);
        }
        out
    }

    fn on(note: u8) -> MidiMessage {
        MidiMessage::NoteOn { channel: 0, note, velocity: 100 }
    }

    fn off(note: u8) -> MidiMessage {
        MidiMessage::NoteOff { channel: 0, note, velocity: 0 }
    }

    #[test]
    fn test_octave_up_then_note_scenario() {
        let mut engine = engine(
            &[
                (0x10, KeyBinding::Note(60)),
                (0x1e, KeyBinding::Control(ControlAction::OctaveUp)),
            ],
            DuplicatePolicy::Never,
        );

        assert!(run(&mut engine, &[press(0x1e)]).is_empty());
        assert_eq!(engine.transpose(), 12);

        assert_eq!(run(&mut engine, &[press(0x10)]), vec![on(72)]);
        assert_eq!(run(&mut engine, &[release(0x10)]), vec![off(72)]);
        assert!(run(&mut engine, &[release(0x1e)]).is_empty());
        assert!(engine.ledger().is_empty());
    }

    #[test]
    fn test_never_policy_suppresses_shared_note() {
        let mut engine = engine(
            &[(16, KeyBinding::Note(60)), (17, KeyBinding::Note(60))],
            DuplicatePolicy::Never,
        );

        assert_eq!(run(&mut engine, &[press(16), press(17)]), vec![on(60)]);
        assert!(run(&mut engine, &[release(16)]).is_empty());
        assert_eq!(run(&mut engine, &[release(17)]), vec![off(60)]);
        assert!(engine.ledger().is_empty());
    }

    #[test]
    fn test_always_policy_pairs_every_press() {
        let mut engine = engine(
            &[(16, KeyBinding::Note(60)), (17, KeyBinding::Note(60))],
            DuplicatePolicy::Always,
        );

        let out = run(&mut engine, &[press(16), press(17), release(16), release(17)]);
        assert_eq!(out, vec![on(60), on(60), off(60), off(60)]);
    }

    #[test]
    fn test_new_presses_only_holds_note_until_last_key() {
        let mut engine = engine(
            &[(16, KeyBinding::Note(60)), (17, KeyBinding::Note(60))],
            DuplicatePolicy::NewPressesOnly,
        );

        assert_eq!(run(&mut engine, &[press(16), press(17)]), vec![on(60)]);
        // 17 still holds the note
        assert!(run(&mut engine, &[release(16)]).is_empty());
        assert_eq!(run(&mut engine, &[release(17)]), vec![off(60)]);
        assert!(engine.ledger().is_empty());

        assert_eq!(run(&mut engine, &[press(17), release(17)]), vec![on(60), off(60)]);
    }

    #[test]
    fn test_derived_notes_share_the_ledger() {
        let mut engine = engine(
            &[(16, KeyBinding::Note(60)), (17, KeyBinding::Note(67))],
            DuplicatePolicy::Never,
        )
        .with_modifier(Box::new(ParallelModifier::new(vec![7])));

        // 67 is already sounding as 16's fifth
        assert_eq!(run(&mut engine, &[press(16)]), vec![on(60), on(67)]);
        assert_eq!(run(&mut engine, &[press(17)]), vec![on(74)]);

        // 17 keeps 67 alive
        assert_eq!(run(&mut engine, &[release(16)]), vec![off(60)]);
        assert_eq!(run(&mut engine, &[release(17)]), vec![off(67), off(74)]);
        assert!(engine.ledger().is_empty());
    }

    #[test]
    fn test_inert_controls_do_nothing() {
        let mut engine = engine(
            &[(78, KeyBinding::Control(ControlAction::OctaveAdd))],
            DuplicatePolicy::Never,
        );
        assert!(run(&mut engine, &[press(78), release(78)]).is_empty());
        assert_eq!(engine.status(), EngineStatus::default());
    }

    #[test]
    fn test_note_off_uses_channel_of_press() {
        let mut engine = engine(
            &[
                (16, KeyBinding::Note(60)),
                (104, KeyBinding::Control(ControlAction::ChannelUp)),
            ],
            DuplicatePolicy::Never,
        );

        run(&mut engine, &[press(16), press(104)]);
        assert_eq!(engine.channel(), 1);
        assert_eq!(run(&mut engine, &[release(16)]), vec![off(60)]);
    }

    #[test]
    fn test_transpose_wraps_into_note_range() {
        let mut engine = engine(
            &[
                (16, KeyBinding::Note(120)),
                (103, KeyBinding::Control(ControlAction::OctaveUp)),
                (108, KeyBinding::Control(ControlAction::OctaveDown)),
            ],
            DuplicatePolicy::Never,
        );

        for _ in 0..20 {
            run(&mut engine, &[press(103), release(103)]);
        }
        assert_eq!(engine.transpose(), 240);
        // (120 + 240) mod 128
        assert_eq!(engine.emitted_note(120), 104);
        assert_eq!(run(&mut engine, &[press(16)]), vec![on(104)]);
        assert_eq!(run(&mut engine, &[release(16)]), vec![off(104)]);

        for _ in 0..30 {
            run(&mut engine, &[press(108)]);
        }
        assert_eq!(engine.transpose(), -120);
        assert_eq!(engine.emitted_note(0), 8);
    }

    #[test]
    fn test_transpose_saturates_instead_of_overflowing() {
        let mut engine = engine(
            &[(103, KeyBinding::Control(ControlAction::OctaveUp))],
            DuplicatePolicy::Never,
        );
        engine.transpose = i32::MAX - 3;
        run(&mut engine, &[press(103)]);
        assert_eq!(engine.transpose(), i32::MAX);
        assert!(engine.emitted_note(127) <= 127);
    }

    #[test]
    fn test_channel_wraps_and_program_clamps() {
        let mut engine = engine(
            &[
                (1, KeyBinding::Control(ControlAction::ChannelDown)),
                (2, KeyBinding::Control(ControlAction::ProgramDown)),
                (3, KeyBinding::Control(ControlAction::ProgramUp)),
            ],
            DuplicatePolicy::Never,
        );

        run(&mut engine, &[press(1)]);
        assert_eq!(engine.channel(), 15);

        let out = run(&mut engine, &[press(2)]);
        assert_eq!(out, vec![MidiMessage::ProgramChange { channel: 15, program: 0 }]);

        engine.program = 127;
        let out = run(&mut engine, &[press(3)]);
        assert_eq!(out, vec![MidiMessage::ProgramChange { channel: 15, program: 127 }]);
    }

    #[test]
    fn test_panic_reset_and_sustain() {
        let mut engine = engine(
            &[
                (1, KeyBinding::Control(ControlAction::Panic)),
                (2, KeyBinding::Control(ControlAction::Reset)),
                (3, KeyBinding::Control(ControlAction::ChannelUp)),
                (4, KeyBinding::Control(ControlAction::SemitoneUp)),
                (57, KeyBinding::Control(ControlAction::Sustain)),
            ],
            DuplicatePolicy::Never,
        );

        run(&mut engine, &[press(3), press(4)]);
        assert_eq!(run(&mut engine, &[press(1), release(1)]), vec![MidiMessage::all_notes_off(1)]);

        let out = run(&mut engine, &[press(57), release(57)]);
        assert_eq!(
            out,
            vec![
                MidiMessage::ControlChange { channel: 1, cc: CC_SUSTAIN, value: 127 },
                MidiMessage::ControlChange { channel: 1, cc: CC_SUSTAIN, value: 0 },
            ]
        );

        assert!(run(&mut engine, &[press(2)]).is_empty());
        assert_eq!(engine.status(), EngineStatus::default());
    }

    #[test]
    fn test_unbound_and_orphan_release_are_ignored() {
        let mut engine = engine(&[(16, KeyBinding::Note(60))], DuplicatePolicy::Never);
        assert!(run(&mut engine, &[press(99), release(99), release(16)]).is_empty());
        assert!(engine.ledger().is_empty());
    }

    #[test]
    fn test_close_emits_single_all_notes_off() {
        let mut engine = engine(&[(16, KeyBinding::Note(60))], DuplicatePolicy::Never);
        run(&mut engine, &[press(16), press(4)]);

        assert_eq!(engine.close(), MidiMessage::all_notes_off(0));
        assert!(engine.ledger().is_empty());
    }

    #[test]
    fn test_random_velocity_range() {
        let mut engine = TranslationEngine::with_keymap(
            "test",
            [(16, KeyBinding::Note(60))].into_iter().collect(),
            DuplicatePolicy::Always,
        );
        for _ in 0..200 {
            let out = run(&mut engine, &[press(16), release(16)]);
            match out[0] {
                MidiMessage::NoteOn { velocity, .. } => {
                    assert!(RANDOM_VELOCITY.contains(&velocity))
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_parallel_modifier_from_config() {
        let config = KeyMapConfig::from_yaml(
            "notes:\n  16: 60\noptions:\n  velocity: 80\n  parallel: [7]\n",
            std::path::Path::new("power.yml"),
        )
        .unwrap();
        let mut engine = TranslationEngine::new("power", &config);

        let out = run(&mut engine, &[press(16), release(16)]);
        assert_eq!(
            out,
            vec![
                MidiMessage::NoteOn { channel: 0, note: 60, velocity: 80 },
                MidiMessage::NoteOn { channel: 0, note: 67, velocity: 80 },
                MidiMessage::NoteOff { channel: 0, note: 60, velocity: 0 },
                MidiMessage::NoteOff { channel: 0, note: 67, velocity: 0 },
            ]
        );
    }

    fn key_events() -> impl Strategy<Value = Vec<(u8, bool)>> {
        prop::collection::vec((0u8..8, any::<bool>()), 0..64)
    }

    /// Codes 0-4 are notes (two share 60), 5-7 shift transpose/channel
    fn shared_note_engine(policy: DuplicatePolicy) -> TranslationEngine {
        engine(
            &[
                (0, KeyBinding::Note(60)),
                (1, KeyBinding::Note(60)),
                (2, KeyBinding::Note(64)),
                (3, KeyBinding::Note(67)),
                (4, KeyBinding::Note(127)),
                (5, KeyBinding::Control(ControlAction::OctaveUp)),
                (6, KeyBinding::Control(ControlAction::SemitoneDown)),
                (7, KeyBinding::Control(ControlAction::ChannelUp)),
            ],
            policy,
        )
    }

    /// Play `events`, release every key, return the per-channel On/Off balance
    fn play_and_release_all(
        engine: &mut TranslationEngine,
        events: &[(u8, bool)],
    ) -> HashMap<u8, i64> {
        let mut out = Vec::new();
        for &(code, released) in events {
            engine.handle(&RawKeyEvent { device: DEVICE, code, released }, &mut out);
        }
        for code in 0..8 {
            engine.handle(&release(code), &mut out);
        }

        let mut balance: HashMap<u8, i64> = HashMap::new();
        for message in &out {
            match message {
                MidiMessage::NoteOn { channel, .. } => {
                    *balance.entry(*channel).or_default() += 1
                }
                MidiMessage::NoteOff { channel, .. } => {
                    *balance.entry(*channel).or_default() -= 1
                }
                _ => {}
            }
        }
        balance
    }

    proptest! {
        #[test]
        fn prop_never_policy_leaves_no_orphaned_notes(events in key_events()) {
            let mut engine = shared_note_engine(DuplicatePolicy::Never);
            let balance = play_and_release_all(&mut engine, &events);

            prop_assert!(engine.ledger().is_empty());
            prop_assert!(balance.values().all(|b| *b == 0), "unbalanced: {:?}", balance);
        }

        #[test]
        fn prop_parallel_notes_stay_balanced(events in key_events()) {
            let mut engine = shared_note_engine(DuplicatePolicy::NewPressesOnly)
                .with_modifier(Box::new(ParallelModifier::new(vec![4, 7])));
            let balance = play_and_release_all(&mut engine, &events);

            prop_assert!(engine.ledger().is_empty());
            prop_assert!(balance.values().all(|b| *b == 0), "unbalanced: {:?}", balance);
        }
    }
}
