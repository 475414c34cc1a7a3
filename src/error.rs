//! Fault conditions reported by the engine.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, ParticipantId};

/// This enum contains all error conditions this library can report. API
/// functions on the session generally return `Result<_, LockstepError>`;
/// component-level functions signal failure through these variants and the
/// session orchestrator is the sole place they become user-visible
/// termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockstepError {
    /// The execution queue has no room for another event. Fatal to the
    /// session: commands can no longer be guaranteed to execute everywhere.
    QueueFull {
        /// The configured capacity that was exhausted.
        capacity: usize,
    },
    /// The outbound staging queue is full; the local machine is generating
    /// commands faster than they can be flushed.
    OutboundFull {
        /// The configured capacity that was exhausted.
        capacity: usize,
    },
    /// An event was found in the execution queue after its scheduled frame
    /// had already passed, in a mode where that breaks the lockstep
    /// contract.
    PacketTooLate {
        /// Originator of the late event.
        origin: ParticipantId,
        /// The frame the event should have executed on.
        scheduled: Frame,
        /// The frame the session was on when the event was found.
        current: Frame,
    },
    /// A peer's checksum for a past frame disagrees with the locally
    /// recorded one: the simulations have diverged.
    OutOfSync {
        /// The frame at which the divergence was detected.
        frame: Frame,
        /// The locally recorded checksum for that frame.
        local: u32,
        /// The checksum the peer reported.
        remote: u32,
    },
    /// The checksum in a peer's very first keep-alive disagrees with the
    /// local scenario checksum; the machines loaded different scenarios.
    ScenarioMismatch {
        /// The peer whose scenario disagrees.
        origin: ParticipantId,
    },
    /// A peer never responded within the absolute timeout.
    NotResponding {
        /// How long we waited, in milliseconds.
        waited_ms: u128,
    },
    /// The user cancelled the startup handshake.
    Cancelled,
    /// The session has already been stopped; no further operations are
    /// valid on it.
    SessionStopped,
    /// A wire packet could not be parsed.
    MalformedPacket {
        /// Description of what failed to parse.
        context: String,
    },
}

impl Display for LockstepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockstepError::QueueFull { capacity } => {
                write!(f, "execution queue is full ({} slots)", capacity)
            }
            LockstepError::OutboundFull { capacity } => {
                write!(f, "outbound queue is full ({} slots)", capacity)
            }
            LockstepError::PacketTooLate {
                origin,
                scheduled,
                current,
            } => {
                write!(
                    f,
                    "packet received too late: event from participant {} was scheduled for frame {} but we are on frame {}",
                    origin, scheduled, current
                )
            }
            LockstepError::OutOfSync {
                frame,
                local,
                remote,
            } => {
                write!(
                    f,
                    "out of sync at frame {}: local checksum {:#010x}, remote checksum {:#010x}",
                    frame, local, remote
                )
            }
            LockstepError::ScenarioMismatch { origin } => {
                write!(
                    f,
                    "scenario mismatch: participant {} is not playing the same scenario",
                    origin
                )
            }
            LockstepError::NotResponding { waited_ms } => {
                write!(f, "peer not responding after {} ms", waited_ms)
            }
            LockstepError::Cancelled => {
                write!(f, "startup handshake cancelled by the user")
            }
            LockstepError::SessionStopped => {
                write!(f, "the session has been stopped")
            }
            LockstepError::MalformedPacket { context } => {
                write!(f, "malformed packet: {}", context)
            }
        }
    }
}

impl Error for LockstepError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_queue_full() {
        let err = LockstepError::QueueFull { capacity: 100 };
        assert_eq!(format!("{}", err), "execution queue is full (100 slots)");
    }

    #[test]
    fn display_packet_too_late_names_frames() {
        let err = LockstepError::PacketTooLate {
            origin: ParticipantId::new(2),
            scheduled: Frame::new(40),
            current: Frame::new(45),
        };
        let text = format!("{}", err);
        assert!(text.contains("participant 2"));
        assert!(text.contains("frame 40"));
        assert!(text.contains("frame 45"));
    }

    #[test]
    fn display_out_of_sync_shows_both_checksums() {
        let err = LockstepError::OutOfSync {
            frame: Frame::new(35),
            local: 0xdead_beef,
            remote: 0x1234_5678,
        };
        let text = format!("{}", err);
        assert!(text.contains("0xdeadbeef"));
        assert!(text.contains("0x12345678"));
    }

    #[test]
    fn errors_compare_by_value() {
        assert_eq!(LockstepError::Cancelled, LockstepError::Cancelled);
        assert_ne!(
            LockstepError::Cancelled,
            LockstepError::SessionStopped
        );
    }
}
