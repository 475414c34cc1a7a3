//! Desync detection: comparing peer-supplied checksums against our own
//! recent history.
//!
//! Every keep-alive a peer sends carries the rolling checksum of its
//! simulation state at build time. When the local simulation reaches the
//! frame that keep-alive was scheduled for, the peer's checksum is compared
//! against the locally recorded value for the same historical frame. Any
//! mismatch means the simulations have diverged; there is no way to
//! recover, only to diagnose.

use tracing::{debug, warn};

use crate::crc::{add_crc, ChecksumRing, CHECKSUM_RING_LEN};
use crate::sim::Simulation;
use crate::Frame;

/// Result of validating one peer checksum.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The checksums agree.
    Match,
    /// The comparison was skipped: the post-load grace countdown is still
    /// running and freshly loaded state may validly differ in incidental
    /// fields.
    Skipped,
    /// The claim is not comparable: the delay exceeds the ring's reach or
    /// the keep-alive is not for the current frame.
    NotApplicable,
    /// The checksums disagree: the simulations have diverged.
    Mismatch {
        /// The historical frame the checksums describe.
        frame: Frame,
        /// Our recorded checksum for that frame.
        local: u32,
        /// The checksum the peer reported.
        remote: u32,
    },
}

/// Tracks per-frame state checksums and validates peer claims against them.
#[derive(Debug, Clone)]
pub struct DivergenceDetector {
    ring: ChecksumRing,
    /// Frames remaining during which comparisons are skipped (post-load).
    skip: u32,
    /// The frame the countdown was last charged for. Timer resends deliver
    /// duplicate claims for one frame; they share a single skip.
    last_skipped: Frame,
}

impl DivergenceDetector {
    /// Creates a detector that skips its first `skip_frames` comparisons.
    #[must_use]
    pub fn new(skip_frames: u32) -> Self {
        DivergenceDetector {
            ring: ChecksumRing::new(),
            skip: skip_frames,
            last_skipped: Frame::NULL,
        }
    }

    /// Records the locally computed checksum for `frame`.
    pub fn record_frame(&mut self, frame: Frame, crc: u32) {
        self.ring.record(frame, crc);
    }

    /// Returns the recorded checksum for `frame`.
    #[must_use]
    pub fn value_at(&self, frame: Frame) -> u32 {
        self.ring.value_at(frame)
    }

    /// Restarts the post-load grace countdown (after loading a save or a
    /// mid-game reconnect).
    pub fn begin_skip(&mut self, frames: u32) {
        self.skip = frames;
        self.last_skipped = Frame::NULL;
    }

    /// Validates a peer's claimed checksum.
    ///
    /// The keep-alive was scheduled for `header_frame` with look-ahead
    /// `delay`, so it describes the sender's state at
    /// `header_frame - delay`. The comparison only fires when the local
    /// simulation is exactly at `header_frame` (the point at which the
    /// local ring is guaranteed to still hold that historical slot) and the
    /// delay is within the ring's reach.
    pub fn verify(
        &mut self,
        local_frame: Frame,
        header_frame: Frame,
        delay: u8,
        remote_crc: u32,
    ) -> VerifyOutcome {
        if usize::from(delay) >= CHECKSUM_RING_LEN || header_frame != local_frame {
            return VerifyOutcome::NotApplicable;
        }
        if self.skip > 0 || header_frame == self.last_skipped {
            if header_frame != self.last_skipped {
                self.skip -= 1;
                self.last_skipped = header_frame;
            }
            debug!(
                frame = header_frame.as_i64(),
                remaining = self.skip,
                "skipping checksum comparison during post-load grace"
            );
            return VerifyOutcome::Skipped;
        }

        let historical = header_frame - i64::from(delay);
        let local = self.ring.value_at(historical);
        if local == remote_crc {
            VerifyOutcome::Match
        } else {
            warn!(
                frame = historical.as_i64(),
                local = format_args!("{:#010x}", local),
                remote = format_args!("{:#010x}", remote_crc),
                "state checksum mismatch"
            );
            VerifyOutcome::Mismatch {
                frame: historical,
                local,
                remote: remote_crc,
            }
        }
    }
}

/// Computes the rolling checksum of the full simulation state for the
/// current frame: every live entity's contribution in the simulation's
/// deterministic traversal order, then the random-number generator state.
#[must_use]
pub fn frame_checksum(sim: &dyn Simulation) -> u32 {
    let mut acc = 0u32;
    sim.for_each_entity(&mut |entity| {
        entity.add_to(&mut acc);
    });
    add_crc(&mut acc, sim.rng_state());
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_checksum_passes() {
        let mut det = DivergenceDetector::new(0);
        det.record_frame(Frame::new(35), 0xfeed);
        let outcome = det.verify(Frame::new(40), Frame::new(40), 5, 0xfeed);
        assert_eq!(outcome, VerifyOutcome::Match);
    }

    #[test]
    fn mismatch_reports_historical_frame() {
        // The end-to-end divergence scenario: a keep-alive declaring
        // delay 5 on frame 40 whose checksum disagrees with our slot for
        // frame 35.
        let mut det = DivergenceDetector::new(0);
        det.record_frame(Frame::new(35), 0x1111);
        let outcome = det.verify(Frame::new(40), Frame::new(40), 5, 0x2222);
        assert_eq!(
            outcome,
            VerifyOutcome::Mismatch {
                frame: Frame::new(35),
                local: 0x1111,
                remote: 0x2222,
            }
        );
    }

    #[test]
    fn comparison_requires_current_frame() {
        let mut det = DivergenceDetector::new(0);
        det.record_frame(Frame::new(35), 0x1111);
        let outcome = det.verify(Frame::new(41), Frame::new(40), 5, 0x2222);
        assert_eq!(outcome, VerifyOutcome::NotApplicable);
    }

    #[test]
    fn delay_beyond_ring_reach_is_not_comparable() {
        let mut det = DivergenceDetector::new(0);
        let outcome = det.verify(Frame::new(100), Frame::new(100), 32, 0x2222);
        assert_eq!(outcome, VerifyOutcome::NotApplicable);
    }

    #[test]
    fn skip_countdown_suppresses_comparisons() {
        let mut det = DivergenceDetector::new(2);

        // The first two frames with comparable claims are skipped even
        // though they disagree; the third is compared.
        assert_eq!(
            det.verify(Frame::new(1), Frame::new(1), 1, 0xbbbb),
            VerifyOutcome::Skipped
        );
        assert_eq!(
            det.verify(Frame::new(2), Frame::new(2), 1, 0xbbbb),
            VerifyOutcome::Skipped
        );
        assert!(matches!(
            det.verify(Frame::new(3), Frame::new(3), 1, 0xbbbb),
            VerifyOutcome::Mismatch { .. }
        ));
    }

    #[test]
    fn duplicate_claims_for_one_frame_share_a_skip() {
        let mut det = DivergenceDetector::new(1);

        // A timer-resent keep-alive repeats the claim for the same frame;
        // the countdown is charged once per frame, not once per claim.
        assert_eq!(
            det.verify(Frame::new(1), Frame::new(1), 1, 0xbbbb),
            VerifyOutcome::Skipped
        );
        assert_eq!(
            det.verify(Frame::new(1), Frame::new(1), 1, 0xbbbb),
            VerifyOutcome::Skipped
        );
        assert!(matches!(
            det.verify(Frame::new(2), Frame::new(2), 1, 0xcccc),
            VerifyOutcome::Mismatch { .. }
        ));
    }

    #[test]
    fn begin_skip_rearms_the_countdown() {
        let mut det = DivergenceDetector::new(0);
        det.begin_skip(1);
        assert_eq!(
            det.verify(Frame::new(1), Frame::new(1), 1, 0xdead),
            VerifyOutcome::Skipped
        );
    }

    #[test]
    fn non_comparable_claims_do_not_consume_skip() {
        let mut det = DivergenceDetector::new(1);
        // Wrong frame: not comparable, countdown untouched.
        assert_eq!(
            det.verify(Frame::new(2), Frame::new(1), 1, 0xdead),
            VerifyOutcome::NotApplicable
        );
        // The skip still applies to the first comparable claim.
        assert_eq!(
            det.verify(Frame::new(1), Frame::new(1), 1, 0xdead),
            VerifyOutcome::Skipped
        );
    }
}
