//! Session configuration.

use web_time::Duration;

use crate::do_list::DEFAULT_DO_LIST_CAPACITY;
use crate::network::packet::Strategy;
use crate::SessionMode;

/// Tunable parameters of a lockstep session.
///
/// Both sides of a session must agree on `strategy`; the timing fields are
/// local policy and may differ per machine. [`Default`] gives conservative
/// values suitable for most connections; [`lan`](SessionConfig::lan) and
/// [`internet`](SessionConfig::internet) are tighter and looser presets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// The kind of session; decides how strictly protocol violations are
    /// treated.
    pub mode: SessionMode,
    /// Wire layout for command records. Must match on every machine.
    pub strategy: Strategy,
    /// Initial look-ahead delay in frames: locally issued commands are
    /// scheduled for `current + look_ahead` to give them time to reach
    /// every peer.
    pub look_ahead: u8,
    /// How many frames the local machine may run past the slowest peer
    /// before the advancement gate closes.
    pub max_ahead: u32,
    /// Flush staged commands every this many frames. 1 sends every frame.
    pub send_rate: u32,
    /// Upper bound on command records per datagram.
    pub max_events_per_packet: usize,
    /// Size of the datagram build buffer, in bytes.
    pub packet_capacity: usize,
    /// Capacity of the execution queue, in events.
    pub do_list_capacity: usize,
    /// Capacity of the outbound staging queue, in commands.
    pub outbound_capacity: usize,
    /// While waiting on silent peers, re-send our keep-alive this often.
    pub resend_interval: Duration,
    /// After this long without progress the host is told to show a
    /// reconnecting display.
    pub dialog_timeout: Duration,
    /// After this long without progress the stalled peers are given up on.
    pub absolute_timeout: Duration,
    /// Checksum comparisons to skip right after loading a saved game,
    /// while incidental state settles.
    pub desync_skip_frames: u32,
    /// Keep running after a detected divergence instead of stopping. For
    /// diagnostics sessions only.
    pub continue_on_desync: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            mode: SessionMode::Network,
            strategy: Strategy::Compressed,
            look_ahead: 5,
            max_ahead: 10,
            send_rate: 1,
            max_events_per_packet: 64,
            packet_capacity: 512,
            do_list_capacity: DEFAULT_DO_LIST_CAPACITY,
            outbound_capacity: 256,
            resend_interval: Duration::from_millis(500),
            dialog_timeout: Duration::from_secs(5),
            absolute_timeout: Duration::from_secs(30),
            desync_skip_frames: 0,
            continue_on_desync: false,
        }
    }
}

impl SessionConfig {
    /// Preset for low-latency local networks: short look-ahead, tight
    /// timeouts.
    #[must_use]
    pub fn lan() -> Self {
        SessionConfig {
            look_ahead: 3,
            max_ahead: 6,
            resend_interval: Duration::from_millis(250),
            dialog_timeout: Duration::from_secs(3),
            absolute_timeout: Duration::from_secs(15),
            ..SessionConfig::default()
        }
    }

    /// Preset for high-latency connections: long look-ahead, generous
    /// timeouts.
    #[must_use]
    pub fn internet() -> Self {
        SessionConfig {
            look_ahead: 8,
            max_ahead: 16,
            resend_interval: Duration::from_secs(1),
            dialog_timeout: Duration::from_secs(10),
            absolute_timeout: Duration::from_secs(60),
            ..SessionConfig::default()
        }
    }

    /// Preset for single-machine play: no peers, no lateness fatality.
    #[must_use]
    pub fn solo() -> Self {
        SessionConfig {
            mode: SessionMode::Solo,
            look_ahead: 0,
            ..SessionConfig::default()
        }
    }
}
