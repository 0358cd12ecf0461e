//! MIDI utilities and message types
//!
//! Channel voice messages produced by the translation engine. Messages are
//! `Copy` and encode into a fixed three-byte buffer so the realtime callback
//! never allocates.

use std::fmt;

/// Control Change number for All Notes Off (channel mode message)
pub const CC_ALL_NOTES_OFF: u8 = 0x7B;

/// Control Change number for the sustain pedal
pub const CC_SUSTAIN: u8 = 0x40;

/// MIDI message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note Off: channel (0-15), note (0-127), velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },

    /// Note On: channel (0-15), note (0-127), velocity (0-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },

    /// Control Change: channel (0-15), cc (0-127), value (0-127)
    ControlChange { channel: u8, cc: u8, value: u8 },

    /// Program Change: channel (0-15), program (0-127)
    ProgramChange { channel: u8, program: u8 },
}

/// Encoded message bytes (1-3 bytes, no heap)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBytes {
    buf: [u8; 3],
    len: usize,
}

impl RawBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl MidiMessage {
    /// All Notes Off on `channel`
    pub fn all_notes_off(channel: u8) -> Self {
        MidiMessage::ControlChange {
            channel,
            cc: CC_ALL_NOTES_OFF,
            value: 0,
        }
    }

    /// Encode the message to MIDI bytes
    pub fn encode(&self) -> RawBytes {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => RawBytes {
                buf: [0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
                len: 3,
            },
            MidiMessage::NoteOn { channel, note, velocity } => RawBytes {
                buf: [0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
                len: 3,
            },
            MidiMessage::ControlChange { channel, cc, value } => RawBytes {
                buf: [0xB0 | (channel & 0x0F), cc & 0x7F, value & 0x7F],
                len: 3,
            },
            MidiMessage::ProgramChange { channel, program } => RawBytes {
                buf: [0xC0 | (channel & 0x0F), program & 0x7F, 0],
                len: 2,
            },
        }
    }

    /// Channel of the message (0-15)
    pub fn channel(&self) -> u8 {
        match *self {
            MidiMessage::NoteOff { channel, .. }
            | MidiMessage::NoteOn { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. } => channel,
        }
    }

    /// Whether this is an All Notes Off control message
    pub fn is_all_notes_off(&self) -> bool {
        matches!(self, MidiMessage::ControlChange { cc: CC_ALL_NOTES_OFF, .. })
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                write!(f, "NoteOff ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                write!(f, "NoteOn ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", channel + 1, cc, value)
            }
            MidiMessage::ProgramChange { channel, program } => {
                write!(f, "ProgramChange ch:{} p:{}", channel + 1, program)
            }
        }
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_notes_off_encoding() {
        let msg = MidiMessage::all_notes_off(3);
        assert_eq!(msg.encode().as_slice(), &[0xB3, 0x7B, 0x00]);
        assert!(msg.is_all_notes_off());
        assert_eq!(msg.channel(), 3);
    }

    #[test]
    fn test_program_change_is_two_bytes() {
        let msg = MidiMessage::ProgramChange { channel: 1, program: 5 };
        assert_eq!(msg.encode().as_slice(), &[0xC1, 5]);
    }

    #[test]
    fn test_encode_masks_out_of_range_values() {
        let msg = MidiMessage::NoteOn { channel: 17, note: 200, velocity: 255 };
        assert_eq!(msg.encode().as_slice(), &[0x91, 200 & 0x7F, 0x7F]);
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0x90, 0x3C, 0x64]), "90 3C 64");
    }
}
