//! Per-peer synchronization state and the frame advancement gate.
//!
//! For every remote peer the tracker records the frame that peer has
//! reached, how many commands it claims to have sent, and how many we have
//! actually received. The session may only advance when every peer's
//! commands are accounted for and no peer has fallen more than the
//! look-ahead window behind.

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::{Frame, ParticipantId, MAX_PARTICIPANTS};

/// A backwards jump in a peer's claimed sent-count larger than this is
/// logged as suspicious. Legitimate wrap-around shows up as a small forward
/// difference, never a large backward one.
pub const SENT_COUNT_BACKJUMP_THRESHOLD: u16 = 500;

/// Wrapping comparison of two `u16` counters: `a >= b` under the convention
/// that the true values never differ by more than half the counter range.
#[inline]
#[must_use]
pub fn wrapping_ge(a: u16, b: u16) -> bool {
    a.wrapping_sub(b) < 0x8000
}

/// Synchronization state for one remote peer.
#[derive(Debug, Clone)]
pub struct PeerSync {
    /// The peer.
    pub id: ParticipantId,
    /// The highest frame the peer is known to have reached. `NULL` until
    /// its first keep-alive; never moves backwards.
    pub remote_frame: Frame,
    /// Total commands the peer claims to have sent (wrapping).
    pub remote_sent: u16,
    /// Total commands we have received from the peer (wrapping).
    pub received: u16,
    /// Whether the startup handshake has seen this peer's first keep-alive.
    pub ready: bool,
}

impl PeerSync {
    fn new(id: ParticipantId) -> Self {
        PeerSync {
            id,
            remote_frame: Frame::NULL,
            remote_sent: 0,
            received: 0,
            ready: false,
        }
    }

    /// Whether everything the peer claims to have sent has arrived.
    #[inline]
    #[must_use]
    pub fn caught_up(&self) -> bool {
        wrapping_ge(self.received, self.remote_sent)
    }
}

/// Tracks synchronization state for all remote peers, in joining order.
#[derive(Debug, Clone, Default)]
pub struct SyncTracker {
    peers: SmallVec<[PeerSync; MAX_PARTICIPANTS]>,
}

impl SyncTracker {
    /// Creates a tracker for the given peers.
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = ParticipantId>) -> Self {
        SyncTracker {
            peers: ids.into_iter().map(PeerSync::new).collect(),
        }
    }

    /// Number of tracked peers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are tracked (solo play).
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterates peers in tracking order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerSync> {
        self.peers.iter()
    }

    /// The state for `id`, if tracked.
    #[must_use]
    pub fn get(&self, id: ParticipantId) -> Option<&PeerSync> {
        self.peers.iter().find(|p| p.id == id)
    }

    fn get_mut(&mut self, id: ParticipantId) -> Option<&mut PeerSync> {
        self.peers.iter_mut().find(|p| p.id == id)
    }

    /// Applies a keep-alive header from `origin`: the header's scheduled
    /// frame, the look-ahead delay it was built with, and the sender's
    /// claimed total sent-count.
    ///
    /// Returns `true` when this header made the peer ready for the first
    /// time.
    pub fn note_header(
        &mut self,
        origin: ParticipantId,
        frame: Frame,
        delay: u8,
        total_sent: u16,
    ) -> bool {
        let Some(peer) = self.get_mut(origin) else {
            debug!(peer = %origin, "keep-alive from untracked peer ignored");
            return false;
        };

        // The header is stamped for sender_frame + delay.
        let sender_frame = frame - i64::from(delay);
        if sender_frame > peer.remote_frame {
            peer.remote_frame = sender_frame;
        }

        let backjump = peer.remote_sent.wrapping_sub(total_sent);
        if backjump > SENT_COUNT_BACKJUMP_THRESHOLD && backjump < 0x8000 {
            warn!(
                peer = %origin,
                previous = peer.remote_sent,
                claimed = total_sent,
                "peer sent-count jumped backwards"
            );
        }
        if wrapping_ge(total_sent, peer.remote_sent) {
            peer.remote_sent = total_sent;
        }

        let newly_ready = !peer.ready;
        peer.ready = true;
        newly_ready
    }

    /// Records `count` commands received from `origin`.
    pub fn note_commands(&mut self, origin: ParticipantId, count: u16) {
        if let Some(peer) = self.get_mut(origin) {
            peer.received = peer.received.wrapping_add(count);
        }
    }

    /// How many peers have announced themselves.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.peers.iter().filter(|p| p.ready).count()
    }

    /// Whether every peer has announced itself.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.peers.iter().all(|p| p.ready)
    }

    /// The frame advancement gate.
    ///
    /// With no peers the gate is always open. Otherwise advancing from
    /// `current` requires that every peer is caught up (everything it
    /// claims to have sent has arrived) and that `current` stays within
    /// `max_ahead` frames of the slowest peer. A peer that has never sent a
    /// keep-alive counts as being on frame zero.
    #[must_use]
    pub fn can_advance(&self, current: Frame, max_ahead: u32) -> bool {
        if self.peers.is_empty() {
            return true;
        }
        if !self.peers.iter().all(PeerSync::caught_up) {
            return false;
        }
        let slowest = self
            .peers
            .iter()
            .map(|p| {
                if p.remote_frame.is_null() {
                    Frame::ZERO
                } else {
                    p.remote_frame
                }
            })
            .min()
            .unwrap_or(Frame::ZERO);
        current < slowest + i64::from(max_ahead)
    }

    /// Stops tracking `id` (peer departed or was dropped). The gate no
    /// longer waits on it.
    pub fn remove(&mut self, id: ParticipantId) {
        self.peers.retain(|p| p.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u8) -> ParticipantId {
        ParticipantId::new(n)
    }

    fn tracker(ids: &[u8]) -> SyncTracker {
        SyncTracker::new(ids.iter().copied().map(pid))
    }

    #[test]
    fn empty_tracker_always_advances() {
        let t = SyncTracker::default();
        assert!(t.can_advance(Frame::new(1000), 1));
    }

    #[test]
    fn gate_closed_until_first_keep_alive_window_allows() {
        let mut t = tracker(&[1]);
        // Never-heard-from peer counts as frame zero; within the window the
        // gate is open, beyond it closed.
        assert!(t.can_advance(Frame::ZERO, 5));
        assert!(!t.can_advance(Frame::new(5), 5));

        // Keep-alive for frame 10 built with delay 2: the peer is on 8.
        t.note_header(pid(1), Frame::new(10), 2, 0);
        assert!(t.can_advance(Frame::new(12), 5));
        assert!(!t.can_advance(Frame::new(13), 5));
    }

    #[test]
    fn gate_closed_while_commands_outstanding() {
        let mut t = tracker(&[1]);
        t.note_header(pid(1), Frame::new(100), 0, 3);
        assert!(!t.can_advance(Frame::new(50), 1000));
        t.note_commands(pid(1), 3);
        assert!(t.can_advance(Frame::new(50), 1000));
    }

    #[test]
    fn gate_waits_on_slowest_peer() {
        let mut t = tracker(&[1, 2]);
        t.note_header(pid(1), Frame::new(100), 0, 0);
        t.note_header(pid(2), Frame::new(10), 0, 0);
        assert!(t.can_advance(Frame::new(14), 5));
        assert!(!t.can_advance(Frame::new(15), 5));
    }

    #[test]
    fn remote_frame_never_regresses() {
        let mut t = tracker(&[1]);
        t.note_header(pid(1), Frame::new(50), 0, 0);
        // A retransmitted older keep-alive must not pull the peer back.
        t.note_header(pid(1), Frame::new(40), 0, 0);
        assert_eq!(t.get(pid(1)).unwrap().remote_frame, Frame::new(50));
    }

    #[test]
    fn readiness_reported_once() {
        let mut t = tracker(&[1]);
        assert!(!t.all_ready());
        assert!(t.note_header(pid(1), Frame::ZERO, 0, 0));
        assert!(!t.note_header(pid(1), Frame::ZERO, 0, 0));
        assert!(t.all_ready());
        assert_eq!(t.ready_count(), 1);
    }

    #[test]
    fn counters_wrap_cleanly() {
        let mut t = tracker(&[1]);
        t.note_commands(pid(1), u16::MAX);
        t.note_commands(pid(1), 2);
        // received is now 1 after wrap; a claim of 1 is satisfied.
        t.note_header(pid(1), Frame::new(1), 0, 1);
        assert!(t.get(pid(1)).unwrap().caught_up());
    }

    #[test]
    fn removed_peer_no_longer_gates() {
        let mut t = tracker(&[1, 2]);
        t.note_header(pid(1), Frame::new(100), 0, 0);
        // Peer 2 is silent and would close the gate.
        assert!(!t.can_advance(Frame::new(50), 5));
        t.remove(pid(2));
        assert!(t.can_advance(Frame::new(50), 200));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn untracked_peer_header_is_ignored() {
        let mut t = tracker(&[1]);
        assert!(!t.note_header(pid(9), Frame::new(5), 0, 0));
        assert!(t.get(pid(9)).is_none());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// wrapping_ge matches plain >= whenever the counters are close in
        /// the unwrapped domain.
        #[test]
        fn prop_wrapping_ge_agrees_near(base in any::<u16>(), delta in 0u16..0x8000) {
            let a = base.wrapping_add(delta);
            prop_assert!(wrapping_ge(a, base));
            if delta != 0 {
                prop_assert!(!wrapping_ge(base, a));
            }
        }

        /// wrapping_ge is reflexive.
        #[test]
        fn prop_wrapping_ge_reflexive(a in any::<u16>()) {
            prop_assert!(wrapping_ge(a, a));
        }
    }
}
