//! Congestion window for one (peer, traffic class) pair.
//!
//! The window is an inclusive range `[lower, upper]` of link sequence numbers
//! the sender may have in flight, plus a bitmap of which slots have already
//! been acknowledged:
//!
//! ```text
//!        lower                        upper
//!          v                            v
//!   ... ## [ #  .  #  .  .  .  .  .  .  ] .  .      # = acked, . = not yet
//!          ^-- bitmap[0]                  ^-- bitmap may extend past upper
//! ```
//!
//! Every sequence number below `lower` is acknowledged.  Acknowledging the
//! leftmost run of slots slides both bounds right by the run length, so the
//! window size is preserved across a slide.
//!
//! The size follows TCP's two phases: it doubles while below `threshold`
//! (slow start) and grows by one above it (congestion avoidance).  A timeout
//! collapses it to the base size; a duplicate ack halves it more gently.
//! The bitmap is never trimmed on shrink, so acknowledgments recorded above
//! the new `upper` survive.  Growth stops at `max`, which bounds the bitmap.

use std::collections::VecDeque;

/// Point-in-time view of a window, for statistics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub lower: u64,
    pub upper: u64,
    pub threshold: u64,
}

impl WindowSnapshot {
    pub fn size(&self) -> u64 {
        self.upper - self.lower + 1
    }
}

#[derive(Debug, Clone)]
pub struct CongestionWindow {
    lower: u64,
    upper: u64,
    acked: VecDeque<bool>,
    threshold: u64,
    base: u64,
    max: u64,
}

impl CongestionWindow {
    /// A window covering `[1, base]` with the given slow-start threshold.
    ///
    /// `base` is raised to 1 and `max` to `base` if configured lower.
    pub fn new(base: u64, threshold: u64, max: u64) -> Self {
        let base = base.max(1);
        let max = max.max(base);
        Self {
            lower: 1,
            upper: base,
            acked: VecDeque::from(vec![false; base as usize]),
            threshold,
            base,
            max,
        }
    }

    /// `true` iff `seq` is inside the window and not yet acknowledged.
    pub fn can_send(&self, seq: u64) -> bool {
        seq >= self.lower && seq <= self.upper && !self.slot(seq).unwrap_or(false)
    }

    /// `true` if `seq` is below the window or its slot is set.
    pub fn already_acked(&self, seq: u64) -> bool {
        seq < self.lower || self.slot(seq).unwrap_or(false)
    }

    /// Record the acknowledgment of `seq` and slide the window.
    ///
    /// Returns `false` when `seq` was already acknowledged or lies beyond
    /// anything this window has ever admitted.
    pub fn mark_acked(&mut self, seq: u64) -> bool {
        if seq < self.lower {
            return false;
        }
        let Some(slot) = self.acked.get_mut((seq - self.lower) as usize) else {
            return false;
        };
        if *slot {
            return false;
        }
        *slot = true;
        self.slide();
        true
    }

    fn slide(&mut self) {
        let run = self.acked.iter().take_while(|acked| **acked).count();
        if run == 0 {
            return;
        }
        self.acked.drain(..run);
        self.acked.extend(std::iter::repeat(false).take(run));
        self.lower += run as u64;
        self.upper += run as u64;
    }

    /// Grow after an acknowledged round trip.
    pub fn on_successful_round_trip(&mut self) {
        let size = self.size();
        let grown = if size >= self.threshold {
            size + 1
        } else {
            size * 2
        };
        self.resize(grown.min(self.max));
    }

    /// Collapse to the base size after a retransmission timeout.
    pub fn on_timeout(&mut self) {
        self.threshold = (self.size() / 2).max(self.base);
        self.resize(self.base);
    }

    /// Halve after repeated acknowledgments of the same packet.
    pub fn on_duplicate_ack(&mut self) {
        self.threshold = (self.size() / 2).max(self.base);
        self.resize(self.threshold);
    }

    fn resize(&mut self, size: u64) {
        let size = size.max(1);
        self.upper = self.lower + size - 1;
        if (self.acked.len() as u64) < size {
            self.acked.resize(size as usize, false);
        }
    }

    fn slot(&self, seq: u64) -> Option<bool> {
        seq.checked_sub(self.lower)
            .and_then(|offset| self.acked.get(offset as usize).copied())
    }

    pub fn lower_bound(&self) -> u64 {
        self.lower
    }

    pub fn upper_bound(&self) -> u64 {
        self.upper
    }

    pub fn size(&self) -> u64 {
        self.upper - self.lower + 1
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            lower: self.lower,
            upper: self.upper,
            threshold: self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> CongestionWindow {
        CongestionWindow::new(4, 16, 1024)
    }

    #[test]
    fn fresh_window_admits_base_range() {
        let w = window();
        assert!(!w.can_send(0));
        assert!((1..=4).all(|s| w.can_send(s)));
        assert!(!w.can_send(5));
        assert!(!w.already_acked(1));
    }

    #[test]
    fn out_of_order_ack_does_not_slide() {
        let mut w = window();
        assert!(w.mark_acked(2));
        assert_eq!(w.lower_bound(), 1);
        assert!(!w.can_send(2));
        assert!(w.already_acked(2));
        assert!(w.can_send(1));
    }

    #[test]
    fn contiguous_acks_slide_and_preserve_size() {
        let mut w = window();
        w.mark_acked(2);
        w.mark_acked(3);
        w.mark_acked(1);
        assert_eq!(w.lower_bound(), 4);
        assert_eq!(w.upper_bound(), 7);
        assert_eq!(w.size(), 4);
        assert!(w.already_acked(1));
        assert!(w.can_send(7));
    }

    #[test]
    fn ack_below_lower_is_noop() {
        let mut w = window();
        w.mark_acked(1);
        assert!(!w.mark_acked(1));
        assert_eq!(w.snapshot().lower, 2);
    }

    #[test]
    fn ack_beyond_bitmap_is_ignored() {
        let mut w = window();
        assert!(!w.mark_acked(100));
        assert!(!w.already_acked(100));
    }

    #[test]
    fn slow_start_doubles_then_avoidance_adds_one() {
        let mut w = CongestionWindow::new(4, 10, 1024);
        w.on_successful_round_trip();
        assert_eq!(w.size(), 8);
        w.on_successful_round_trip();
        assert_eq!(w.size(), 16);
        w.on_successful_round_trip();
        assert_eq!(w.size(), 17);
        assert!(w.can_send(17));
    }

    #[test]
    fn growth_is_capped_at_max() {
        let mut w = CongestionWindow::new(4, 1000, 6);
        w.on_successful_round_trip();
        assert_eq!(w.size(), 6);
        w.on_successful_round_trip();
        assert_eq!(w.size(), 6);
    }

    #[test]
    fn timeout_resets_to_base_from_lower() {
        let mut w = CongestionWindow::new(4, 100, 1024);
        w.mark_acked(1);
        w.on_successful_round_trip();
        w.on_successful_round_trip();
        assert_eq!(w.size(), 16);
        w.on_timeout();
        assert_eq!(w.threshold(), 8);
        assert_eq!(w.lower_bound(), 2);
        assert_eq!(w.upper_bound(), 5);
    }

    #[test]
    fn slow_start_resumes_from_base_after_timeout() {
        let mut w = CongestionWindow::new(4, 100, 1024);
        w.on_successful_round_trip();
        w.on_successful_round_trip();
        assert_eq!(w.size(), 16);

        w.on_timeout();
        assert_eq!(w.size(), 4);
        w.on_successful_round_trip();
        assert_eq!(w.size(), 8);
        // Threshold is now 8: linear from here.
        w.on_successful_round_trip();
        assert_eq!(w.size(), 9);
    }

    #[test]
    fn timeout_threshold_never_below_base() {
        let mut w = window();
        w.on_timeout();
        assert_eq!(w.threshold(), 4);
        assert_eq!(w.size(), 4);
    }

    #[test]
    fn duplicate_ack_halves_to_threshold() {
        let mut w = CongestionWindow::new(4, 100, 1024);
        for _ in 0..3 {
            w.on_successful_round_trip();
        }
        assert_eq!(w.size(), 32);
        w.on_duplicate_ack();
        assert_eq!(w.threshold(), 16);
        assert_eq!(w.size(), 16);
    }

    #[test]
    fn acks_above_upper_survive_shrink() {
        let mut w = CongestionWindow::new(2, 100, 1024);
        w.on_successful_round_trip();
        w.mark_acked(4);
        w.on_timeout();
        assert_eq!(w.upper_bound(), 2);
        assert!(w.already_acked(4));
        w.mark_acked(1);
        w.mark_acked(2);
        w.mark_acked(3);
        // 1..=4 all acked, so the slide jumps past 4.
        assert_eq!(w.lower_bound(), 5);
        assert_eq!(w.size(), 2);
    }

    #[test]
    fn bounds_stay_ordered_through_mixed_events() {
        let mut w = CongestionWindow::new(3, 5, 64);
        for seq in 1..200 {
            if w.can_send(seq) {
                w.mark_acked(seq);
            }
            match seq % 7 {
                0 => w.on_timeout(),
                3 => w.on_duplicate_ack(),
                _ => w.on_successful_round_trip(),
            }
            let snap = w.snapshot();
            assert!(snap.lower <= snap.upper);
            assert!(snap.size() <= 64);
        }
    }
}
