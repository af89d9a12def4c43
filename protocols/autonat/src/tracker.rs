// Copyright 2022 Protocol Labs.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Confidence-weighted folding of probe observations into a reachability
//! verdict. Confidence moves by at most one per observation and stays
//! within `[0, MAX_CONFIDENCE]`; flapping observations therefore have to
//! out-vote the accumulated history before the verdict flips.

use peerlink_core::Reachability;

pub const MAX_CONFIDENCE: u8 = 3;

#[derive(Clone, Copy, Debug, Default)]
pub struct ConfidenceTracker {
    reachability: Reachability,
    confidence: u8,
}

impl ConfidenceTracker {
    pub fn reachability(&self) -> Reachability {
        self.reachability
    }

    pub fn confidence(&self) -> u8 {
        self.confidence
    }

    /// Fold in one observation. Returns the new state when the verdict
    /// changed, i.e. when an event should be emitted.
    pub fn observe(&mut self, observation: Reachability) -> Option<(Reachability, u8)> {
        match observation {
            Reachability::Public => {
                if self.reachability != Reachability::Public {
                    self.reachability = Reachability::Public;
                    self.confidence = 0;
                    return Some((self.reachability, self.confidence));
                }
                self.confidence = (self.confidence + 1).min(MAX_CONFIDENCE);
                None
            }
            Reachability::Private => {
                if self.reachability == Reachability::Private {
                    self.confidence = (self.confidence + 1).min(MAX_CONFIDENCE);
                    None
                } else if self.confidence > 0 {
                    self.confidence -= 1;
                    None
                } else {
                    self.reachability = Reachability::Private;
                    Some((self.reachability, self.confidence))
                }
            }
            Reachability::Unknown => {
                if self.confidence > 0 {
                    self.confidence -= 1;
                    None
                } else if self.reachability != Reachability::Unknown {
                    self.reachability = Reachability::Unknown;
                    Some((self.reachability, self.confidence))
                } else {
                    None
                }
            }
        }
    }

    /// Our addresses changed; a verdict held with full confidence is now
    /// in doubt.
    pub fn on_address_change(&mut self) {
        if self.confidence == MAX_CONFIDENCE {
            self.confidence -= 1;
        }
    }

    /// Whether the verdict is settled (nothing to gain from eager probes).
    pub fn is_settled(&self) -> bool {
        self.reachability != Reachability::Unknown && self.confidence == MAX_CONFIDENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_private_observations() {
        let mut tracker = ConfidenceTracker::default();
        let mut events = 0;
        for _ in 0..3 {
            if tracker.observe(Reachability::Private).is_some() {
                events += 1;
            }
        }
        // First observation flips to Private with confidence 0, the next
        // two only raise confidence.
        assert_eq!(events, 1);
        assert_eq!(tracker.reachability(), Reachability::Private);
        assert_eq!(tracker.confidence(), 2);
    }

    #[test]
    fn public_switch_is_immediate() {
        let mut tracker = ConfidenceTracker::default();
        for _ in 0..4 {
            tracker.observe(Reachability::Private);
        }
        assert_eq!(tracker.confidence(), MAX_CONFIDENCE);
        let changed = tracker.observe(Reachability::Public);
        assert_eq!(changed, Some((Reachability::Public, 0)));
    }

    #[test]
    fn private_needs_to_outvote_public() {
        let mut tracker = ConfidenceTracker::default();
        tracker.observe(Reachability::Public);
        tracker.observe(Reachability::Public);
        assert_eq!(tracker.confidence(), 1);
        // One contrary observation only drains confidence.
        assert!(tracker.observe(Reachability::Private).is_none());
        assert_eq!(tracker.reachability(), Reachability::Public);
        // The next one flips.
        assert!(tracker.observe(Reachability::Private).is_some());
        assert_eq!(tracker.reachability(), Reachability::Private);
    }

    #[test]
    fn confidence_is_bounded_and_moves_by_one() {
        let mut tracker = ConfidenceTracker::default();
        let mut last = tracker.confidence();
        for obs in [
            Reachability::Public,
            Reachability::Public,
            Reachability::Public,
            Reachability::Public,
            Reachability::Public,
            Reachability::Unknown,
            Reachability::Private,
            Reachability::Unknown,
            Reachability::Unknown,
            Reachability::Unknown,
        ] {
            tracker.observe(obs);
            let now = tracker.confidence();
            assert!(now <= MAX_CONFIDENCE);
            assert!(now.abs_diff(last) <= 1, "confidence jumped {last} -> {now}");
            last = now;
        }
    }

    #[test]
    fn unknown_only_emits_once_drained() {
        let mut tracker = ConfidenceTracker::default();
        tracker.observe(Reachability::Public);
        tracker.observe(Reachability::Public);
        assert!(tracker.observe(Reachability::Unknown).is_none());
        assert_eq!(tracker.reachability(), Reachability::Public);
        assert!(tracker.observe(Reachability::Unknown).is_some());
        assert_eq!(tracker.reachability(), Reachability::Unknown);
    }

    #[test]
    fn address_change_reopens_settled_verdict() {
        let mut tracker = ConfidenceTracker::default();
        for _ in 0..4 {
            tracker.observe(Reachability::Public);
        }
        assert!(tracker.is_settled());
        tracker.on_address_change();
        assert!(!tracker.is_settled());
        assert_eq!(tracker.confidence(), MAX_CONFIDENCE - 1);
    }
}
