//! Client-side coalescing of edits per cell.

use std::collections::BTreeMap;
use tally_core::{now, CellValue, FieldKey, PendingChange};

/// Pending edits keyed by cell; at most one entry per key.
///
/// A new edit to a buffered cell overwrites its new value and keeps the
/// value the cell had before the first buffered edit.
#[derive(Debug, Default, Clone)]
pub struct ChangeBuffer {
    pending: BTreeMap<FieldKey, PendingChange>,
}

impl ChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the pending edit for `key`.
    pub fn record(&mut self, key: FieldKey, old_value: CellValue, new_value: CellValue) {
        match self.pending.get_mut(&key) {
            Some(existing) => {
                existing.new_value = new_value;
                existing.captured_at = now();
            }
            None => {
                self.pending
                    .insert(key.clone(), PendingChange::new(key, old_value, new_value));
            }
        }
    }

    /// Move every pending edit out, leaving the buffer empty for edits that
    /// arrive while the batch is in flight.
    pub fn take(&mut self) -> Vec<PendingChange> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Put a failed batch back. Edits recorded since the batch was taken are
    /// newer and win; their `old_value` reverts to the batch's.
    pub fn restore(&mut self, batch: Vec<PendingChange>) {
        for change in batch {
            match self.pending.get_mut(&change.key) {
                Some(newer) => newer.old_value = change.old_value,
                None => {
                    self.pending.insert(change.key.clone(), change);
                }
            }
        }
    }

    pub fn get(&self, key: &FieldKey) -> Option<&PendingChange> {
        self.pending.get(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use tally_test_utils::generators::arb_edit_sequence;

    #[test]
    fn test_overwrite_keeps_first_old_value() {
        let mut buffer = ChangeBuffer::new();
        let key = FieldKey::expense(1, 1);
        buffer.record(key.clone(), CellValue::Empty, 100.0.into());
        buffer.record(key.clone(), 100.0.into(), 200.0.into());

        assert_eq!(buffer.len(), 1);
        let pending = buffer.get(&key).expect("edit should be buffered");
        assert_eq!(pending.old_value, CellValue::Empty);
        assert_eq!(pending.new_value, CellValue::Number(200.0));
    }

    #[test]
    fn test_restore_does_not_clobber_newer_edit() {
        let mut buffer = ChangeBuffer::new();
        let a = FieldKey::expense(1, 1);
        let b = FieldKey::expense(1, 2);
        buffer.record(a.clone(), CellValue::Empty, 1.0.into());
        buffer.record(b.clone(), CellValue::Empty, 2.0.into());

        let batch = buffer.take();
        assert!(buffer.is_empty());

        // Edit during the round trip.
        buffer.record(a.clone(), 1.0.into(), 10.0.into());
        buffer.restore(batch);

        assert_eq!(buffer.len(), 2);
        let a_pending = buffer.get(&a).expect("a should be buffered");
        assert_eq!(a_pending.new_value, CellValue::Number(10.0));
        assert_eq!(a_pending.old_value, CellValue::Empty);
        assert_eq!(
            buffer.get(&b).map(|p| p.new_value.clone()),
            Some(CellValue::Number(2.0))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// One entry per edited cell, carrying the last value written to it.
        #[test]
        fn prop_buffer_coalesces_to_last_value(edits in arb_edit_sequence(60)) {
            let mut buffer = ChangeBuffer::new();
            let mut expected = HashMap::new();
            for (key, value) in &edits {
                buffer.record(key.clone(), CellValue::Empty, value.clone());
                expected.insert(key.clone(), value.clone());
            }

            let batch = buffer.take();
            prop_assert_eq!(batch.len(), expected.len());
            for change in batch {
                prop_assert_eq!(Some(&change.new_value), expected.get(&change.key));
            }
        }
    }
}
