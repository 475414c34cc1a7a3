//! Events: the immutable-once-sent commands the engine synchronizes.
//!
//! An [`Event`] records who issued a command, what the command is, and the
//! frame on which every machine must execute it. The command itself is a
//! closed tagged enum, [`EventData`]; the variable-size payload union of
//! older engines is replaced by enum variants that own their data.

use serde::{Deserialize, Serialize};

use crate::{Frame, ParticipantId};

/// Identifies a simulation object a command acts on.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TargetId(pub u32);

/// A mission / order code understood by the simulation.
///
/// The engine never interprets the code; it only carries it and uses
/// equality to merge compound-order runs on the wire.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct MissionId(pub u8);

/// A map cell destination.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Cell {
    /// Column.
    pub x: u16,
    /// Row.
    pub y: u16,
}

impl Cell {
    /// Creates a cell from column and row.
    #[inline]
    #[must_use]
    pub const fn new(x: u16, y: u16) -> Self {
        Cell { x, y }
    }
}

/// The shared fields of an order: what to do, to whom, and where.
///
/// Compound-order compression merges consecutive orders whose `OrderFields`
/// compare equal into a single wire run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OrderFields {
    /// The mission / order code.
    pub mission: MissionId,
    /// The object the order is directed at, if any.
    pub target: TargetId,
    /// The destination cell.
    pub destination: Cell,
}

/// The synchronization header carried by frame-info (keep-alive) records:
/// the sender's rolling state checksum, its claimed total command count,
/// and the look-ahead delay its events are being scheduled with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SyncHeader {
    /// Rolling checksum of the sender's simulation state at build time.
    pub crc: u32,
    /// Total commands the sender claims to have sent so far. Intentionally
    /// narrow and wrapping; only differences are meaningful.
    pub total_sent: u16,
    /// The sender's look-ahead delay, in frames.
    pub delay: u8,
}

/// The closed set of command kinds the engine synchronizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventData {
    /// A single-subject mission assignment.
    Mission {
        /// The object receiving the order.
        subject: TargetId,
        /// The order itself.
        order: OrderFields,
    },
    /// A compound (multi-subject) mission assignment. Consecutive
    /// `MegaMission` events sharing identical [`OrderFields`] are merged
    /// into one run on the wire.
    MegaMission {
        /// The object receiving the order.
        subject: TargetId,
        /// The order shared by the run.
        order: OrderFields,
    },
    /// Sell a structure.
    Sell {
        /// The structure being sold.
        subject: TargetId,
    },
    /// Toggle repair on a structure.
    Repair {
        /// The structure being repaired.
        subject: TargetId,
    },
    /// Place a special weapon strike.
    SpecialPlace {
        /// Which special weapon.
        weapon: u8,
        /// Where it lands.
        cell: Cell,
    },
    /// A new participant joining; carries an opaque variable-size payload
    /// the simulation interprets.
    AddParticipant {
        /// Opaque join data.
        payload: Vec<u8>,
    },
    /// Frame-info / keep-alive: asserts the sender's frame position and
    /// checksum without carrying a command. Generated by the session, never
    /// queued by the host.
    FrameInfo(SyncHeader),
    /// A request to change the session's look-ahead delay.
    FrameRateChange {
        /// The requested look-ahead delay, in frames.
        delay: u8,
    },
    /// A report of the sender's average per-frame processing time.
    ProcessTime {
        /// Average ticks the sender spends per frame.
        average_ticks: u16,
    },
    /// The participant is leaving the session.
    Exit,
    /// The participant opened the options menu.
    Options,
}

impl EventData {
    /// Whether this is a frame-info / keep-alive record rather than a real
    /// command.
    #[inline]
    #[must_use]
    pub const fn is_frame_info(&self) -> bool {
        matches!(self, EventData::FrameInfo(_))
    }

    /// Whether a remote-originated event of this kind tears down the
    /// sender's connection instead of executing.
    #[inline]
    #[must_use]
    pub const fn is_departure(&self) -> bool {
        matches!(self, EventData::Exit | EventData::Options)
    }
}

/// A command stamped with its originator and scheduled execution frame.
///
/// Events are immutable once sent; the only field that changes afterwards
/// is the local `executed` mark. The scheduled frame is set to
/// "current local frame + look-ahead delay" at the moment of packet
/// building, never earlier, and is never rescheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// The participant that issued the command.
    pub origin: ParticipantId,
    /// The simulation frame on which every machine must execute it.
    pub frame: Frame,
    /// Whether this machine has executed it. Local bookkeeping only; never
    /// transmitted.
    pub executed: bool,
    /// The command.
    pub data: EventData,
}

impl Event {
    /// Creates a not-yet-executed event.
    #[must_use]
    pub fn new(origin: ParticipantId, frame: Frame, data: EventData) -> Self {
        Event {
            origin,
            frame,
            executed: false,
            data,
        }
    }
}
