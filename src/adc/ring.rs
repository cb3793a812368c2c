//! Bounded circular store for raw sample codes.

/// Fixed-capacity ring of raw 16-bit codes with most-recent-overwrites-oldest
/// semantics. The cursor always points at the most recently written slot and
/// stays within `[0, capacity)`; wraparound is explicit modular arithmetic,
/// never integer underflow.
pub struct SampleRing {
    slots: Vec<u16>,
    cursor: usize,
    total: u32,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SampleRing {
            slots: vec![0; capacity],
            cursor: capacity - 1,
            total: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Zero every slot and forget all history. The first push after a clear
    /// lands in slot 0.
    pub fn clear(&mut self) {
        self.slots.fill(0);
        self.cursor = self.slots.len() - 1;
        self.total = 0;
    }

    /// Append a code, evicting the oldest once full. The total-samples tally
    /// saturates instead of wrapping.
    pub fn push(&mut self, code: u16) {
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.slots[self.cursor] = code;
        self.total = self.total.saturating_add(1);
    }

    /// Samples recorded since the last clear, saturating.
    pub fn total_samples(&self) -> u32 {
        self.total
    }

    /// How many samples a backward walk may legitimately visit.
    pub fn available(&self) -> u32 {
        self.total.min(self.slots.len() as u32)
    }

    /// The most recently written code, if any sample exists.
    pub fn latest(&self) -> Option<u16> {
        if self.total == 0 {
            None
        } else {
            Some(self.slots[self.cursor])
        }
    }

    /// Sum of the `count` most recent codes, newest first. `count` must not
    /// exceed [`SampleRing::available`]; callers clamp before walking.
    pub fn sum_recent(&self, count: u32) -> u64 {
        let mut sum = 0u64;
        let mut pos = self.cursor;
        for _ in 0..count {
            sum += u64::from(self.slots[pos]);
            pos = if pos == 0 { self.slots.len() - 1 } else { pos - 1 };
        }
        sum
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_push_lands_in_slot_zero() {
        let mut ring = SampleRing::new(4);
        ring.push(7);
        assert_eq!(ring.cursor(), 0);
        assert_eq!(ring.latest(), Some(7));
        assert_eq!(ring.total_samples(), 1);
    }

    #[test]
    fn overwrite_evicts_oldest() {
        let mut ring = SampleRing::new(3);
        for code in [1u16, 2, 3, 4] {
            ring.push(code);
        }
        // Buffer now holds [4, 2, 3] with the cursor back at slot 0.
        assert_eq!(ring.cursor(), 0);
        assert_eq!(ring.available(), 3);
        assert_eq!(ring.sum_recent(3), 4 + 3 + 2);
        assert_eq!(ring.latest(), Some(4));
    }

    #[test]
    fn cursor_stays_in_range_across_many_wraps() {
        let mut ring = SampleRing::new(5);
        for code in 0..37u16 {
            ring.push(code);
            assert!(ring.cursor() < ring.capacity());
        }
        assert_eq!(ring.total_samples(), 37);
        assert_eq!(ring.available(), 5);
    }

    #[test]
    fn clear_zeroes_slots_and_history() {
        let mut ring = SampleRing::new(4);
        for code in [9u16, 9, 9, 9, 9] {
            ring.push(code);
        }
        ring.clear();
        assert_eq!(ring.total_samples(), 0);
        assert_eq!(ring.latest(), None);
        assert_eq!(ring.sum_recent(0), 0);
        ring.push(5);
        assert_eq!(ring.cursor(), 0);
    }

    #[test]
    fn backward_walk_wraps_through_slot_zero() {
        let mut ring = SampleRing::new(3);
        for code in [10u16, 20, 30, 40, 50] {
            ring.push(code);
        }
        // Buffer holds [40, 50, 30]; a three-sample walk from slot 1
        // passes through slot 0 and wraps up to slot 2.
        assert_eq!(ring.sum_recent(3), 120);
    }
}
