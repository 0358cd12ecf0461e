//! Press ledger: which notes each held key is responsible for

use std::collections::HashMap;

/// One note recorded against a held key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sounding {
    pub channel: u8,
    pub note: u8,
}

/// Key code → notes recorded by its press(es)
#[derive(Debug, Default)]
pub struct PressLedger {
    keys: HashMap<u8, Vec<Sounding>>,
}

impl PressLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, code: u8, entry: Sounding) {
        self.keys.entry(code).or_default().push(entry);
    }

    /// Remove and return everything recorded for `code`
    pub fn take(&mut self, code: u8) -> Option<Vec<Sounding>> {
        self.keys.remove(&code)
    }

    /// Any key holds `(channel, note)`
    pub fn is_held(&self, channel: u8, note: u8) -> bool {
        self.entries()
            .any(|s| s.channel == channel && s.note == note)
    }

    /// Number of keys currently held
    pub fn active_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    fn entries(&self) -> impl Iterator<Item = &Sounding> {
        self.keys.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sounding(note: u8) -> Sounding {
        Sounding { channel: 0, note }
    }

    #[test]
    fn test_record_and_take() {
        let mut ledger = PressLedger::new();
        ledger.record(16, sounding(60));
        ledger.record(16, sounding(67));
        ledger.record(17, sounding(62));

        assert_eq!(ledger.active_keys(), 2);
        assert_eq!(ledger.take(16), Some(vec![sounding(60), sounding(67)]));
        assert_eq!(ledger.take(16), None);
        assert_eq!(ledger.active_keys(), 1);
    }

    #[test]
    fn test_held_by_any_key_on_channel() {
        let mut ledger = PressLedger::new();
        ledger.record(16, sounding(60));

        assert!(ledger.is_held(0, 60));
        assert!(!ledger.is_held(1, 60));
        assert!(!ledger.is_held(0, 61));

        ledger.take(16);
        assert!(!ledger.is_held(0, 60));

        ledger.record(17, sounding(60));
        ledger.clear();
        assert!(ledger.is_empty());
    }
}
