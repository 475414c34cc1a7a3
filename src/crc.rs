//! Rolling state checksums for desync detection.
//!
//! Every frame, the session folds each live simulation entity's
//! contribution into a single `u32` accumulator with [`add_crc`], a
//! left-rotate-then-add mixer. Rotation before addition makes the combiner
//! order-sensitive: the same contributions in a different order yield a
//! different checksum, so a divergence in entity iteration order is caught
//! as readily as a divergence in entity state.
//!
//! Per-frame results are retained in a small [`ChecksumRing`] so that a
//! peer's claimed checksum for a recent historical frame can be validated
//! without keeping full history.

use crate::{Frame, ParticipantId};

/// Number of per-frame checksums retained. Must be a power of two: ring
/// slots are selected by masking the frame number, not by modulo.
pub const CHECKSUM_RING_LEN: usize = 32;

const _: () = assert!(CHECKSUM_RING_LEN.is_power_of_two());

/// Folds `value` into the rolling checksum accumulator.
///
/// The accumulator is rotated left one bit and the value added with
/// wrapping. This is deliberately not commutative; see the module docs.
#[inline]
pub fn add_crc(acc: &mut u32, value: u32) {
    *acc = acc.rotate_left(1).wrapping_add(value);
}

/// A fixed-capacity ring of per-frame state checksums, indexed by
/// `frame & (CHECKSUM_RING_LEN - 1)`.
///
/// The ring answers "what was my checksum on frame F" for any F within the
/// last [`CHECKSUM_RING_LEN`] frames. Older slots are silently overwritten;
/// the protocol guarantees peers never ask about frames older than the
/// look-ahead window, which is far smaller than the ring.
#[derive(Debug, Clone, Default)]
pub struct ChecksumRing {
    slots: [u32; CHECKSUM_RING_LEN],
}

impl ChecksumRing {
    /// Creates a ring with all slots zeroed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn index(frame: Frame) -> usize {
        debug_assert!(frame.is_valid());
        (frame.as_i64() as usize) & (CHECKSUM_RING_LEN - 1)
    }

    /// Stores the checksum computed for `frame`.
    pub fn record(&mut self, frame: Frame, value: u32) {
        self.slots[Self::index(frame)] = value;
    }

    /// Returns the stored checksum for `frame`.
    ///
    /// If `frame` is more than [`CHECKSUM_RING_LEN`] frames in the past the
    /// slot has been overwritten and the value belongs to a newer frame;
    /// callers enforce the recency bound before comparing.
    #[must_use]
    pub fn value_at(&self, frame: Frame) -> u32 {
        self.slots[Self::index(frame)]
    }
}

/// Capability implemented by every simulation entity kind that participates
/// in state checksumming and desync diagnostics.
///
/// The simulation exposes its entities through
/// [`Simulation::for_each_entity`](crate::Simulation::for_each_entity) in a
/// deterministic traversal order; each entity folds its position,
/// orientation, and mode fields into the accumulator.
pub trait ContributesChecksum {
    /// Folds this entity's state into the rolling accumulator. The fields
    /// contributed must be identical on every machine for an in-sync game.
    fn add_to(&self, acc: &mut u32);

    /// The participant that owns this entity. Dump rows are grouped by
    /// owner for offline comparison between machines.
    fn owner(&self) -> ParticipantId;

    /// A short category label ("infantry", "building", ...) used to group
    /// dump rows within an owner.
    fn category(&self) -> &'static str;

    /// One human-readable diagnostic row describing this entity's
    /// checksummed state.
    fn describe(&self) -> String;
}
