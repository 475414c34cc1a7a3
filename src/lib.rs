//! # Bastion Lockstep
//!
//! Bastion Lockstep is a deterministic-lockstep multiplayer synchronization
//! engine written in 100% safe Rust. It collects user-generated commands
//! ("events") on each participating machine, guarantees that every machine
//! executes the identical sequence of events on the identical simulation
//! frame, detects divergence between machines via rolling state checksums,
//! and manages the flow-control protocol that keeps independent machines
//! from running too far ahead of each other over an unreliable transport.
//!
//! The crate does not implement a transport, a renderer, or a simulation.
//! Those are consumed as capabilities: a [`ConnectionManager`] pumps and
//! delivers datagrams, a [`Simulation`] executes commands and contributes
//! per-entity checksums, and the host's own loop drives
//! [`LockstepSession::advance`] once per logical tick. The session never
//! blocks; when it cannot make progress it returns
//! [`TickOutcome::Waiting`](session::lockstep::TickOutcome::Waiting) and
//! expects to be polled again.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use web_time::Duration;

pub use crc::{add_crc, ChecksumRing, ContributesChecksum, CHECKSUM_RING_LEN};
pub use divergence::{DivergenceDetector, VerifyOutcome};
pub use do_list::{DoList, OutboundQueue};
pub use error::LockstepError;
pub use event::{Cell, Event, EventData, MissionId, OrderFields, SyncHeader, TargetId};
pub use network::packet::{DecodeOutcome, EncodeOutcome, PacketHeader, Strategy};
pub use peer_sync::{PeerSync, SyncTracker};
pub use session::config::SessionConfig;
pub use session::lockstep::{LockstepSession, StartupStatus, TickOutcome};
pub use sim::{ConnectionManager, Simulation};

pub mod crc;
pub mod diagnostics;
pub mod divergence;
pub mod do_list;
pub mod error;
pub mod event;
pub mod peer_sync;
pub mod sim;

/// Wire-level packet building and parsing.
pub mod network {
    pub mod codec;
    pub mod packet;
}

/// The per-session orchestrator and its configuration.
pub mod session {
    pub mod config;
    pub mod lockstep;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / not yet heard from.
pub const NULL_FRAME: i64 = -1;

/// Upper bound on participants in a session, including the local machine.
///
/// Per-peer arrays are stack-allocated up to this size.
pub const MAX_PARTICIPANTS: usize = 8;

/// A frame is a single step of the shared simulation.
///
/// Frames are the fundamental unit of time in lockstep networking: every
/// participant executes the identical event sequence on the identical frame
/// number. The special value [`Frame::NULL`] (-1) means "no frame" or
/// "not yet heard from this peer".
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i64);

impl Frame {
    /// The null frame, representing "no frame" or "uninitialized".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Frame zero, where every session starts.
    pub const ZERO: Frame = Frame(0);

    /// Creates a new `Frame` from an `i64` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: i64) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i64` value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i64> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i64) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i64> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i64> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i64) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i64;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i64> for Frame {
    #[inline]
    fn from(value: i64) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i64 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i64> for Frame {
    #[inline]
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i64> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// The fixed, globally agreed identifier of a participating machine.
///
/// Participant identifiers double as the ordering key for event execution:
/// every machine scans the execution queue once per participant in ascending
/// identifier order, never in packet-arrival order, which is the central
/// determinism guarantee of the engine.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ParticipantId(u8);

impl ParticipantId {
    /// Creates a new `ParticipantId` from a `u8` value.
    #[inline]
    #[must_use]
    pub const fn new(id: u8) -> Self {
        ParticipantId(id)
    }

    /// Returns the underlying `u8` value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for ParticipantId {
    #[inline]
    fn from(value: u8) -> Self {
        ParticipantId(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// The kind of session being run, which decides how strictly protocol
/// violations are treated.
///
/// New single-machine modes must be added here and classified in
/// [`is_networked`](SessionMode::is_networked) explicitly; nothing is
/// inferred from naming.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionMode {
    /// Single-player. Lateness is tolerated; there are no peers.
    Solo,
    /// Unranked practice against local AI. Lateness is tolerated.
    Skirmish,
    /// A real networked session. Lateness and divergence are fatal.
    Network,
    /// Playback of a recorded session on one machine. Departed participants
    /// are handed to AI control instead of being removed.
    Playback,
}

impl SessionMode {
    /// Whether this mode runs against real remote peers.
    ///
    /// Only networked modes treat a late event as a fatal protocol
    /// violation.
    #[inline]
    #[must_use]
    pub const fn is_networked(self) -> bool {
        matches!(self, SessionMode::Network)
    }
}

/// A session is always in one of these states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The startup handshake: waiting for every peer to be heard from once.
    WaitingForPeers,
    /// Synchronized and exchanging commands.
    Running,
    /// Terminated, either normally or by a fatal protocol fault.
    Stopped,
}

/// Notifications produced for the host UI / diagnostics layer.
///
/// Drain them each tick via [`LockstepSession::events`]. Handling them is up
/// to the host; the session has already taken whatever protocol action the
/// condition requires.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionEvent {
    /// A peer was heard from for the first time during the startup
    /// handshake.
    PeerReady {
        /// The peer that became ready.
        id: ParticipantId,
    },
    /// A peer left the session or was dropped; its slot has been compacted
    /// out and the session continues without it.
    PeerLeft {
        /// The departed peer.
        id: ParticipantId,
    },
    /// A peer has been quiet long enough that the host should surface a
    /// "reconnecting" display. Emitted periodically while the condition
    /// holds.
    Reconnecting {
        /// Time remaining before the absolute timeout fires.
        remaining: Duration,
    },
    /// A peer (or all peers, at startup) never responded within the
    /// absolute timeout.
    NotResponding,
    /// The very first keep-alive from a peer carried a checksum that does
    /// not match the local scenario; the machines are not playing the same
    /// game.
    ScenarioMismatch {
        /// The peer whose scenario disagrees.
        id: ParticipantId,
    },
    /// The execution queue overflowed. Fatal.
    QueueFull,
    /// A peer's checksum for a past frame disagrees with ours.
    OutOfSync {
        /// The frame at which the states diverged.
        frame: Frame,
    },
    /// An event arrived after its scheduled frame had already executed.
    PacketTooLate {
        /// Originator of the late event.
        origin: ParticipantId,
        /// The frame it should have executed on.
        scheduled: Frame,
        /// The frame we were on when it was found.
        current: Frame,
    },
}

// ###################
// # UNIT TESTS      #
// ###################
