//! The two seams between the engine and the host application: the transport
//! and the simulation.
//!
//! The engine never opens sockets or mutates game state directly. The host
//! hands it a [`ConnectionManager`] for byte transport and a [`Simulation`]
//! for command execution and state checksumming, and the session drives
//! both.

use crate::crc::ContributesChecksum;
use crate::event::Event;
use crate::ParticipantId;

/// Reliable-enough datagram transport over the set of connected peers.
///
/// The engine assumes delivery and ordering are handled below this trait
/// (acknowledged sends, resequencing); what it sees is "a datagram arrived
/// from peer P". Implementations service their own retransmission inside
/// [`service`](ConnectionManager::service).
pub trait ConnectionManager {
    /// Pumps the transport: retransmissions, acknowledgements, connection
    /// upkeep. Called once per session tick.
    fn service(&mut self);

    /// Queues `buf` for delivery to every connected peer. When
    /// `require_ack` is set the transport must retransmit until each peer
    /// acknowledges.
    fn send(&mut self, buf: &[u8], require_ack: bool);

    /// Returns the next datagram received from any peer, if one is
    /// pending.
    fn try_receive(&mut self) -> Option<(ParticipantId, Vec<u8>)>;

    /// Number of currently connected peers (not counting the local
    /// machine).
    fn num_connections(&self) -> usize;

    /// The participant connected at `index`, for
    /// `index < num_connections()`.
    fn connection_id(&self, index: usize) -> Option<ParticipantId>;

    /// The connection index for `id`, if that participant is connected.
    fn connection_index(&self, id: ParticipantId) -> Option<usize>;

    /// A round-trip estimate in milliseconds, used to scale resend and
    /// timeout intervals.
    fn response_time(&self) -> u32;

    /// Tears down the connection to `id`, discarding any queued traffic.
    fn destroy_connection(&mut self, id: ParticipantId);
}

/// The deterministic simulation the engine keeps in lockstep.
///
/// All machines must implement `execute` identically: the same event on the
/// same frame must produce the same state change everywhere, and
/// `for_each_entity` must traverse entities in the same order everywhere.
pub trait Simulation {
    /// Applies one synchronized command to the game state.
    fn execute(&mut self, event: &Event);

    /// Visits every live entity in the simulation's deterministic traversal
    /// order, for checksumming and for desync dumps.
    fn for_each_entity(&self, visit: &mut dyn FnMut(&dyn ContributesChecksum));

    /// The current state of the simulation's random-number generator, folded
    /// into the frame checksum after the entities.
    fn rng_state(&self) -> u32;

    /// Hands a departed participant's assets to computer control (playback
    /// and recovery paths).
    fn convert_to_ai(&mut self, participant: ParticipantId);
}
