//! Resend ledger
//!
//! Keeps the last [`LEDGER_CAPACITY`] framed lines so the firmware can ask
//! for any of them again. Index `i` holds the line framed with sequence
//! number `i + 1`; `count` is the number of lines ever recorded since the
//! last clear.

use printlink_core::ProtocolError;

/// Number of framed lines retained for resends
pub const LEDGER_CAPACITY: usize = 16;

/// Bounded ring of transmitted checksum lines
#[derive(Debug, Clone)]
pub struct ChecksumLedger {
    ring: Vec<String>,
    count: usize,
}

impl Default for ChecksumLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self {
            ring: vec![String::new(); LEDGER_CAPACITY],
            count: 0,
        }
    }

    /// Lines recorded since the last clear. Also the last sequence number used.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Sequence number the next recorded line gets
    pub fn next_sequence(&self) -> usize {
        self.count + 1
    }

    /// Record a framed line
    pub fn add(&mut self, framed: String) {
        self.ring[self.count % LEDGER_CAPACITY] = framed;
        self.count += 1;
    }

    /// Forget everything; numbering restarts at 1
    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// Oldest index still held
    pub fn oldest_retained(&self) -> usize {
        self.count.saturating_sub(LEDGER_CAPACITY)
    }

    /// Framed line at `index`, if still held
    pub fn get(&self, index: usize) -> Option<&str> {
        if index < self.count && index >= self.oldest_retained() {
            Some(&self.ring[index % LEDGER_CAPACITY])
        } else {
            None
        }
    }

    /// Map a firmware resend request for `sequence` to the index to replay from
    ///
    /// A request older than the ring holds restarts from the oldest retained
    /// line and reports [`ProtocolError::ProtocolDesync`]; a request for a line
    /// never sent is refused with [`ProtocolError::ResendAhead`].
    pub fn resend_index(&self, sequence: usize) -> Result<usize, (Option<usize>, ProtocolError)> {
        let index = sequence.saturating_sub(1);
        if index >= self.count {
            return Err((
                None,
                ProtocolError::ResendAhead {
                    requested: sequence,
                    last_sent: self.count,
                },
            ));
        }
        let oldest = self.oldest_retained();
        if index < oldest {
            return Err((
                Some(oldest),
                ProtocolError::ProtocolDesync {
                    requested: sequence,
                    oldest_retained: oldest + 1,
                },
            ));
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> ChecksumLedger {
        let mut ledger = ChecksumLedger::new();
        for seq in 1..=n {
            ledger.add(format!("N{} G1 X{}*0", seq, seq));
        }
        ledger
    }

    #[test]
    fn test_index_holds_sequence_plus_one() {
        let ledger = filled(8);
        assert_eq!(ledger.count(), 8);
        assert_eq!(ledger.get(4), Some("N5 G1 X5*0"));
        assert_eq!(ledger.get(8), None);
    }

    #[test]
    fn test_evicted_entries_are_not_returned() {
        let ledger = filled(20);
        assert_eq!(ledger.oldest_retained(), 4);
        assert_eq!(ledger.get(3), None);
        assert_eq!(ledger.get(4), Some("N5 G1 X5*0"));
        assert_eq!(ledger.get(19), Some("N20 G1 X20*0"));
    }

    #[test]
    fn test_resend_lookup_is_idempotent() {
        let ledger = filled(8);
        let first = ledger.resend_index(5).expect("retained");
        let second = ledger.resend_index(5).expect("retained");
        assert_eq!(first, second);
        assert_eq!(ledger.get(first), ledger.get(second));
    }

    #[test]
    fn test_resend_of_evicted_line_falls_back_to_oldest() {
        let ledger = filled(40);
        match ledger.resend_index(3) {
            Err((Some(fallback), ProtocolError::ProtocolDesync { requested, .. })) => {
                assert_eq!(requested, 3);
                assert_eq!(fallback, 24);
                assert_eq!(ledger.get(fallback), Some("N25 G1 X25*0"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resend_ahead_is_refused() {
        let ledger = filled(3);
        assert!(matches!(
            ledger.resend_index(9),
            Err((None, ProtocolError::ResendAhead { .. }))
        ));
    }

    #[test]
    fn test_clear_restarts_numbering() {
        let mut ledger = filled(5);
        ledger.clear();
        assert_eq!(ledger.count(), 0);
        assert_eq!(ledger.next_sequence(), 1);
        assert_eq!(ledger.get(0), None);
    }
}
