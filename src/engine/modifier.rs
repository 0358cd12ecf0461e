//! Note modifiers
//!
//! A modifier derives extra notes from every note a key plays. Derived notes
//! go through the same duplicate handling and press ledger as the key's own
//! note, so they are released together with it.

pub trait Modifier: Send {
    fn name(&self) -> &str;

    /// Append notes sounded together with `note`
    fn derive(&mut self, note: u8, out: &mut Vec<u8>);
}

/// Sounds fixed intervals alongside every note (power chords, octaves, ...)
#[derive(Debug, Clone)]
pub struct ParallelModifier {
    intervals: Vec<i8>,
}

impl ParallelModifier {
    pub fn new(intervals: Vec<i8>) -> Self {
        Self {
            intervals: intervals.into_iter().filter(|&i| i != 0).collect(),
        }
    }

    fn shifted(note: u8, interval: i8) -> Option<u8> {
        u8::try_from(i16::from(note) + i16::from(interval))
            .ok()
            .filter(|n| *n <= 127)
    }
}

impl Modifier for ParallelModifier {
    fn name(&self) -> &str {
        "parallel"
    }

    fn derive(&mut self, note: u8, out: &mut Vec<u8>) {
        out.extend(
            self.intervals
                .iter()
                .filter_map(|&interval| Self::shifted(note, interval)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_fifth_and_octave() {
        let mut modifier = ParallelModifier::new(vec![7, 12]);
        let mut out = Vec::new();
        modifier.derive(60, &mut out);
        assert_eq!(out, vec![67, 72]);
    }

    #[test]
    fn test_out_of_range_intervals_are_dropped() {
        let mut modifier = ParallelModifier::new(vec![-12, 0, 12]);
        let mut out = Vec::new();
        modifier.derive(120, &mut out);
        assert_eq!(out, vec![108]);

        out.clear();
        modifier.derive(5, &mut out);
        assert_eq!(out, vec![17]);
    }
}
