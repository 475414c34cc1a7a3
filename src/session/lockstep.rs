//! The session orchestrator.
//!
//! [`LockstepSession`] owns the event queues, the peer tracker, and the
//! divergence detector, and drives them from two poll-style entry points:
//! [`poll_startup`](LockstepSession::poll_startup) until every peer has been
//! heard from, then [`advance`](LockstepSession::advance) once per logical
//! tick. Neither call ever blocks; when the session cannot make progress it
//! reports `Waiting` and expects to be polled again, with the host's own
//! loop in control of pacing.

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;

use smallvec::SmallVec;
use tracing::{debug, error, info, warn};
use web_time::{Duration, Instant};

use crate::diagnostics;
use crate::divergence::{frame_checksum, DivergenceDetector, VerifyOutcome};
use crate::do_list::{DoList, OutboundQueue};
use crate::error::LockstepError;
use crate::event::{Event, EventData};
use crate::network::packet::{self, PacketHeader};
use crate::peer_sync::SyncTracker;
use crate::session::config::SessionConfig;
use crate::sim::{ConnectionManager, Simulation};
use crate::{
    Frame, ParticipantId, SessionEvent, SessionMode, SessionState, SyncHeader, MAX_PARTICIPANTS,
};

/// Progress report from [`LockstepSession::poll_startup`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StartupStatus {
    /// Not every peer has been heard from yet; poll again.
    Waiting {
        /// Peers heard from so far.
        ready: usize,
        /// Peers expected.
        total: usize,
    },
    /// Every peer has announced itself; the session is running.
    Ready,
}

/// Result of one [`LockstepSession::advance`] call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// One frame was executed.
    Advanced {
        /// The frame the session is now on.
        frame: Frame,
    },
    /// The advancement gate is closed (missing commands or a peer too far
    /// behind); nothing was executed. Poll again.
    Waiting,
}

/// A deterministic-lockstep session.
///
/// All state is owned by the session; two sessions in one process do not
/// interfere. The host supplies the transport and the simulation on each
/// call rather than at construction so it keeps ownership of both.
pub struct LockstepSession {
    config: SessionConfig,
    local_id: ParticipantId,
    state: SessionState,
    frame: Frame,
    outbound: OutboundQueue,
    do_list: DoList,
    tracker: SyncTracker,
    divergence: DivergenceDetector,
    /// Checksum of the loaded scenario, exchanged in startup keep-alives.
    scenario_crc: u32,
    /// Wrapping count of command records sent so far.
    total_sent: u16,
    /// Current look-ahead delay; starts at the configured value and can be
    /// raised mid-game by a `FrameRateChange` event.
    effective_delay: u8,
    /// Highest per-frame processing time any machine has reported.
    slowest_process_ticks: u16,
    last_flushed: Frame,
    last_recorded: Frame,
    events_out: VecDeque<SessionEvent>,
    wait_started: Option<Instant>,
    last_resend: Option<Instant>,
    cancel_requested: bool,
    scratch: Vec<u8>,
}

impl LockstepSession {
    /// Creates a session for `local_id` against the given remote peers.
    ///
    /// The set of participants and their identifiers must be globally
    /// agreed before the session starts; identifiers are the execution
    /// ordering key on every machine.
    #[must_use]
    pub fn new(
        local_id: ParticipantId,
        peers: impl IntoIterator<Item = ParticipantId>,
        config: SessionConfig,
    ) -> Self {
        let mut ids: SmallVec<[ParticipantId; MAX_PARTICIPANTS]> = peers.into_iter().collect();
        ids.sort_unstable();
        ids.retain(|id| *id != local_id);
        debug_assert!(usize::from(config.look_ahead) < crate::CHECKSUM_RING_LEN);

        let scratch = vec![0u8; config.packet_capacity];
        LockstepSession {
            local_id,
            state: SessionState::WaitingForPeers,
            frame: Frame::ZERO,
            outbound: OutboundQueue::with_capacity(config.outbound_capacity),
            do_list: DoList::with_capacity(config.do_list_capacity),
            tracker: SyncTracker::new(ids),
            divergence: DivergenceDetector::new(config.desync_skip_frames),
            scenario_crc: 0,
            total_sent: 0,
            effective_delay: config.look_ahead,
            slowest_process_ticks: 0,
            last_flushed: Frame::NULL,
            last_recorded: Frame::NULL,
            events_out: VecDeque::new(),
            wait_started: None,
            last_resend: None,
            cancel_requested: false,
            scratch,
            config,
        }
    }

    /// The frame the session will execute next.
    #[inline]
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.frame
    }

    /// The session's lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The local participant.
    #[inline]
    #[must_use]
    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    /// The look-ahead delay currently in effect.
    #[inline]
    #[must_use]
    pub fn effective_delay(&self) -> u8 {
        self.effective_delay
    }

    /// The highest per-frame processing time any machine has reported via
    /// `ProcessTime` events. Hosts use it to pace the logical tick rate.
    #[inline]
    #[must_use]
    pub fn slowest_process_ticks(&self) -> u16 {
        self.slowest_process_ticks
    }

    /// Remote peers still participating.
    #[inline]
    #[must_use]
    pub fn remote_peers(&self) -> usize {
        self.tracker.len()
    }

    /// Declares the checksum of the loaded scenario. Exchanged during the
    /// startup handshake; a peer whose scenario checksum differs is playing
    /// a different game and the session refuses to start.
    pub fn set_scenario_checksum(&mut self, crc: u32) {
        self.scenario_crc = crc;
    }

    /// Resumes a session from a loaded save at `frame`. Checksum
    /// comparisons are suppressed for the configured number of frames while
    /// incidental state settles.
    pub fn resume_from_load(&mut self, frame: Frame) {
        self.frame = frame;
        self.last_recorded = Frame::NULL;
        self.divergence.begin_skip(self.config.desync_skip_frames);
    }

    /// Stages a command for transmission and execution. The command is
    /// stamped with its execution frame at the next flush, not now.
    ///
    /// # Errors
    ///
    /// [`LockstepError::SessionStopped`] after the session has ended;
    /// [`LockstepError::OutboundFull`] when commands are being generated
    /// faster than they can be flushed.
    pub fn queue_command(&mut self, data: EventData) -> Result<(), LockstepError> {
        if self.state == SessionState::Stopped {
            return Err(LockstepError::SessionStopped);
        }
        debug_assert!(!data.is_frame_info());
        self.outbound.push(data)
    }

    /// Requests cancellation of the startup handshake. Takes effect on the
    /// next [`poll_startup`](LockstepSession::poll_startup) call.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    /// Drains the notifications produced since the last call.
    pub fn events(&mut self) -> Drain<'_, SessionEvent> {
        self.events_out.drain(..)
    }

    /// Runs one step of the startup handshake: announce ourselves, collect
    /// peer announcements, and verify everyone loaded the same scenario.
    ///
    /// # Errors
    ///
    /// [`LockstepError::Cancelled`] if the host requested cancellation,
    /// [`LockstepError::ScenarioMismatch`] if a peer loaded a different
    /// scenario, [`LockstepError::NotResponding`] when the absolute timeout
    /// expires, [`LockstepError::SessionStopped`] after the session has
    /// ended. All of these leave the session stopped.
    pub fn poll_startup(
        &mut self,
        conn: &mut dyn ConnectionManager,
    ) -> Result<StartupStatus, LockstepError> {
        match self.state {
            SessionState::Stopped => return Err(LockstepError::SessionStopped),
            SessionState::Running => return Ok(StartupStatus::Ready),
            SessionState::WaitingForPeers => {},
        }
        if self.cancel_requested {
            info!("startup handshake cancelled");
            self.state = SessionState::Stopped;
            return Err(LockstepError::Cancelled);
        }

        conn.service();
        self.receive_all(conn)?;

        if self.tracker.all_ready() {
            info!(peers = self.tracker.len(), "all peers ready, session running");
            // One final announcement so peers still waiting on us learn we
            // are ready even if they have not heard our earlier ones.
            self.send_startup_keep_alive(conn)?;
            self.state = SessionState::Running;
            self.wait_started = None;
            self.last_resend = None;
            return Ok(StartupStatus::Ready);
        }

        let now = Instant::now();
        let started = *self.wait_started.get_or_insert(now);
        let elapsed = now.duration_since(started);

        if elapsed >= self.config.absolute_timeout {
            warn!(
                waited_ms = elapsed.as_millis(),
                ready = self.tracker.ready_count(),
                total = self.tracker.len(),
                "startup handshake timed out"
            );
            self.events_out.push_back(SessionEvent::NotResponding);
            self.state = SessionState::Stopped;
            return Err(LockstepError::NotResponding {
                waited_ms: elapsed.as_millis(),
            });
        }

        let resend = self.resend_interval(conn);
        let due = self
            .last_resend
            .is_none_or(|last| now.duration_since(last) >= resend);
        if due {
            self.last_resend = Some(now);
            if elapsed >= self.config.dialog_timeout {
                self.events_out.push_back(SessionEvent::Reconnecting {
                    remaining: self.config.absolute_timeout - elapsed,
                });
            }
            self.send_startup_keep_alive(conn)?;
        }

        Ok(StartupStatus::Waiting {
            ready: self.tracker.ready_count(),
            total: self.tracker.len(),
        })
    }

    /// Attempts to execute one simulation frame.
    ///
    /// One call performs at most one frame: it collects incoming traffic,
    /// flushes staged commands stamped `current + delay`, and if every
    /// peer's commands are accounted for and no peer is more than the
    /// look-ahead window behind, executes everything scheduled for the
    /// current frame in ascending participant order and moves on.
    ///
    /// # Errors
    ///
    /// Fatal protocol violations ([`LockstepError::QueueFull`],
    /// [`LockstepError::PacketTooLate`], [`LockstepError::OutOfSync`]) stop
    /// the session. [`LockstepError::SessionStopped`] is returned on any
    /// call after that.
    pub fn advance(
        &mut self,
        conn: &mut dyn ConnectionManager,
        sim: &mut dyn Simulation,
    ) -> Result<TickOutcome, LockstepError> {
        match self.state {
            SessionState::Stopped => return Err(LockstepError::SessionStopped),
            SessionState::WaitingForPeers => match self.poll_startup(conn)? {
                StartupStatus::Waiting { .. } => return Ok(TickOutcome::Waiting),
                StartupStatus::Ready => {},
            },
            SessionState::Running => {},
        }

        self.record_current_checksum(sim);
        conn.service();
        self.receive_all(conn)?;
        self.flush_outbound(conn)?;

        if !self.tracker.can_advance(self.frame, self.config.max_ahead) {
            self.tick_wait_timers(conn)?;
            return Ok(TickOutcome::Waiting);
        }
        self.wait_started = None;
        self.last_resend = None;

        self.execute_frame(conn, sim)?;
        self.frame += 1;
        self.record_current_checksum(sim);
        self.do_list.clean(self.frame);
        Ok(TickOutcome::Advanced { frame: self.frame })
    }

    /// Ends the session: announces our departure to every peer, tears down
    /// the connections, and stops.
    pub fn stop(&mut self, conn: &mut dyn ConnectionManager) {
        if self.state == SessionState::Stopped {
            return;
        }
        let header = self.keep_alive_header();
        let departure = [Event::new(self.local_id, header.frame, EventData::Exit)];
        if let Ok(outcome) = packet::encode_packet(
            &mut self.scratch,
            self.config.strategy,
            &header,
            &departure,
            1,
        ) {
            conn.send(&self.scratch[..outcome.bytes], true);
        }
        for index in (0..conn.num_connections()).rev() {
            if let Some(id) = conn.connection_id(index) {
                conn.destroy_connection(id);
            }
        }
        info!(frame = %self.frame, "session stopped");
        self.state = SessionState::Stopped;
    }

    /// The configured resend interval, floored by the transport's
    /// round-trip estimate.
    fn resend_interval(&self, conn: &dyn ConnectionManager) -> Duration {
        self.config
            .resend_interval
            .max(Duration::from_millis(u64::from(conn.response_time())))
    }

    fn keep_alive_header(&self) -> PacketHeader {
        PacketHeader {
            frame: self.frame + i64::from(self.effective_delay),
            origin: self.local_id,
            sync: SyncHeader {
                crc: self.divergence.value_at(self.frame),
                total_sent: self.total_sent,
                delay: self.effective_delay,
            },
        }
    }

    fn send_startup_keep_alive(
        &mut self,
        conn: &mut dyn ConnectionManager,
    ) -> Result<(), LockstepError> {
        // Startup keep-alives are stamped frame zero with no look-ahead and
        // carry the scenario checksum instead of a state checksum.
        let header = PacketHeader {
            frame: Frame::ZERO,
            origin: self.local_id,
            sync: SyncHeader {
                crc: self.scenario_crc,
                total_sent: self.total_sent,
                delay: 0,
            },
        };
        let outcome =
            packet::encode_packet(&mut self.scratch, self.config.strategy, &header, &[], 0)
                .map_err(|e| LockstepError::MalformedPacket {
                    context: e.to_string(),
                })?;
        conn.send(&self.scratch[..outcome.bytes], false);
        Ok(())
    }

    /// Drains the transport and queues everything received.
    fn receive_all(&mut self, conn: &mut dyn ConnectionManager) -> Result<(), LockstepError> {
        while let Some((sender, buf)) = conn.try_receive() {
            let outcome = match packet::decode_packet(&buf, self.config.strategy, &mut self.do_list)
            {
                Ok(outcome) => outcome,
                Err(err @ LockstepError::QueueFull { .. }) => {
                    error!(%err, "execution queue overflow");
                    self.events_out.push_back(SessionEvent::QueueFull);
                    self.state = SessionState::Stopped;
                    return Err(err);
                },
                Err(err) => {
                    // A corrupt datagram is dropped; the transport's
                    // retransmission recovers the contents.
                    warn!(peer = %sender, %err, "dropping malformed datagram");
                    continue;
                },
            };

            self.tracker
                .note_commands(sender, outcome.commands as u16);
            for header in &outcome.headers {
                if self.state == SessionState::WaitingForPeers
                    && header.frame == Frame::ZERO
                    && header.sync.delay == 0
                    && header.sync.crc != self.scenario_crc
                {
                    error!(
                        peer = %header.origin,
                        local = format_args!("{:#010x}", self.scenario_crc),
                        remote = format_args!("{:#010x}", header.sync.crc),
                        "peer loaded a different scenario"
                    );
                    self.events_out
                        .push_back(SessionEvent::ScenarioMismatch { id: header.origin });
                    self.state = SessionState::Stopped;
                    return Err(LockstepError::ScenarioMismatch {
                        origin: header.origin,
                    });
                }
                let newly_ready = self.tracker.note_header(
                    header.origin,
                    header.frame,
                    header.sync.delay,
                    header.sync.total_sent,
                );
                if newly_ready {
                    debug!(peer = %header.origin, "peer ready");
                    self.events_out
                        .push_back(SessionEvent::PeerReady { id: header.origin });
                }
            }
        }
        Ok(())
    }

    /// Builds and sends this frame's datagram: the keep-alive header plus
    /// as many staged commands as fit, each stamped `current + delay` now
    /// and mirrored into the local execution queue.
    fn flush_outbound(&mut self, conn: &mut dyn ConnectionManager) -> Result<(), LockstepError> {
        if self.last_flushed == self.frame {
            return Ok(());
        }
        if self.frame.as_i64() % i64::from(self.config.send_rate.max(1)) != 0 {
            return Ok(());
        }
        self.last_flushed = self.frame;

        let scheduled = self.frame + i64::from(self.effective_delay);
        let mut staged: Vec<Event> = Vec::new();
        while staged.len() < self.config.max_events_per_packet {
            let Some(data) = self.outbound.pop_front() else {
                break;
            };
            staged.push(Event::new(self.local_id, scheduled, data));
        }

        let mut header = self.keep_alive_header();
        header.sync.total_sent = self.total_sent.wrapping_add(staged.len() as u16);
        let mut outcome = packet::encode_packet(
            &mut self.scratch,
            self.config.strategy,
            &header,
            &staged,
            self.config.max_events_per_packet,
        )
        .map_err(|e| LockstepError::MalformedPacket {
            context: e.to_string(),
        })?;
        if outcome.events_written < staged.len() {
            // The datagram overflowed. The header must only claim what this
            // datagram actually carries, so rebuild it with the corrected
            // count; the shorter event list is guaranteed to fit.
            header.sync.total_sent = self.total_sent.wrapping_add(outcome.events_written as u16);
            outcome = packet::encode_packet(
                &mut self.scratch,
                self.config.strategy,
                &header,
                &staged[..outcome.events_written],
                outcome.events_written,
            )
            .map_err(|e| LockstepError::MalformedPacket {
                context: e.to_string(),
            })?;
            // Anything that did not fit goes back to the front, unstamped,
            // for the next datagram.
            for event in staged.drain(outcome.events_written..).rev() {
                self.outbound.push_front(event.data);
            }
        }
        self.total_sent = header.sync.total_sent;

        conn.send(&self.scratch[..outcome.bytes], outcome.events_written > 0);

        // Mirror the sent commands into our own execution queue; our own
        // keep-alive is not queued.
        for event in staged {
            self.do_list.push(event).inspect_err(|_| {
                self.events_out.push_back(SessionEvent::QueueFull);
                self.state = SessionState::Stopped;
            })?;
        }
        Ok(())
    }

    /// Escalation while the gate is closed: periodic keep-alive resends,
    /// then a reconnecting notification, then dropping the stalled peers.
    fn tick_wait_timers(&mut self, conn: &mut dyn ConnectionManager) -> Result<(), LockstepError> {
        let now = Instant::now();
        let started = *self.wait_started.get_or_insert(now);
        let elapsed = now.duration_since(started);

        if elapsed >= self.config.absolute_timeout {
            let stalled = self.blocking_peers();
            for id in stalled {
                warn!(peer = %id, frame = %self.frame, "dropping unresponsive peer");
                conn.destroy_connection(id);
                self.tracker.remove(id);
                self.events_out.push_back(SessionEvent::PeerLeft { id });
            }
            self.wait_started = None;
            self.last_resend = None;
            return Ok(());
        }

        let resend = self.resend_interval(conn);
        let due = self
            .last_resend
            .is_none_or(|last| now.duration_since(last) >= resend);
        if due {
            self.last_resend = Some(now);
            if elapsed >= self.config.dialog_timeout {
                self.events_out.push_back(SessionEvent::Reconnecting {
                    remaining: self.config.absolute_timeout - elapsed,
                });
            }
            let header = self.keep_alive_header();
            let outcome =
                packet::encode_packet(&mut self.scratch, self.config.strategy, &header, &[], 0)
                    .map_err(|e| LockstepError::MalformedPacket {
                        context: e.to_string(),
                    })?;
            conn.send(&self.scratch[..outcome.bytes], false);
        }
        Ok(())
    }

    /// The peers currently holding the gate closed.
    fn blocking_peers(&self) -> SmallVec<[ParticipantId; MAX_PARTICIPANTS]> {
        self.tracker
            .iter()
            .filter(|p| {
                let peer_frame = if p.remote_frame.is_null() {
                    Frame::ZERO
                } else {
                    p.remote_frame
                };
                !p.caught_up()
                    || self.frame >= peer_frame + i64::from(self.config.max_ahead)
            })
            .map(|p| p.id)
            .collect()
    }

    fn record_current_checksum(&mut self, sim: &dyn Simulation) {
        if self.last_recorded != self.frame {
            self.last_recorded = self.frame;
            let crc = frame_checksum(sim);
            self.divergence.record_frame(self.frame, crc);
        }
    }

    /// Executes everything scheduled for the current frame, scanning the
    /// queue once per originating participant in ascending identifier
    /// order. Arrival order never influences execution order.
    fn execute_frame(
        &mut self,
        conn: &mut dyn ConnectionManager,
        sim: &mut dyn Simulation,
    ) -> Result<(), LockstepError> {
        let mut origins: SmallVec<[ParticipantId; MAX_PARTICIPANTS]> = SmallVec::new();
        for event in self.do_list.iter() {
            if !event.executed && !origins.contains(&event.origin) {
                origins.push(event.origin);
            }
        }
        origins.sort_unstable();

        for origin in origins {
            let mut index = 0;
            while let Some(event) = self.do_list.get(index) {
                let due = !event.executed && event.origin == origin && event.frame <= self.frame;
                if !due {
                    index += 1;
                    continue;
                }
                let event = event.clone();
                self.handle_due_event(&event, conn, sim)
                    .inspect_err(|_| {
                        self.state = SessionState::Stopped;
                    })?;
                if let Some(slot) = self.do_list.get_mut(index) {
                    slot.executed = true;
                }
                index += 1;
            }
        }
        Ok(())
    }

    fn handle_due_event(
        &mut self,
        event: &Event,
        conn: &mut dyn ConnectionManager,
        sim: &mut dyn Simulation,
    ) -> Result<(), LockstepError> {
        // Keep-alives are resent on timers and validly trail a machine
        // running ahead; only real commands are bound by the lateness
        // contract.
        if event.frame < self.frame
            && !event.data.is_frame_info()
            && self.config.mode.is_networked()
        {
            let mut dump = Vec::new();
            if diagnostics::write_lateness_dump(
                &mut dump,
                event.origin,
                event.frame,
                self.frame,
                &self.do_list,
                &self.tracker,
            )
            .is_ok()
            {
                error!("{}", String::from_utf8_lossy(&dump));
            }
            self.events_out.push_back(SessionEvent::PacketTooLate {
                origin: event.origin,
                scheduled: event.frame,
                current: self.frame,
            });
            return Err(LockstepError::PacketTooLate {
                origin: event.origin,
                scheduled: event.frame,
                current: self.frame,
            });
        }

        match &event.data {
            EventData::FrameInfo(sync) => {
                self.verify_peer_checksum(event, *sync, sim)?;
            },
            EventData::FrameRateChange { delay } => {
                info!(from = %event.origin, delay, "look-ahead delay changed");
                self.effective_delay = *delay;
            },
            EventData::ProcessTime { average_ticks } => {
                self.slowest_process_ticks = self.slowest_process_ticks.max(*average_ticks);
            },
            data if data.is_departure() && event.origin != self.local_id => {
                if self.config.mode == SessionMode::Playback {
                    info!(peer = %event.origin, "departed participant handed to AI");
                    sim.convert_to_ai(event.origin);
                } else {
                    info!(peer = %event.origin, frame = %self.frame, "peer left the session");
                    conn.destroy_connection(event.origin);
                    self.tracker.remove(event.origin);
                    self.events_out
                        .push_back(SessionEvent::PeerLeft { id: event.origin });
                }
            },
            _ => sim.execute(event),
        }
        Ok(())
    }

    fn verify_peer_checksum(
        &mut self,
        event: &Event,
        sync: SyncHeader,
        sim: &dyn Simulation,
    ) -> Result<(), LockstepError> {
        match self
            .divergence
            .verify(self.frame, event.frame, sync.delay, sync.crc)
        {
            VerifyOutcome::Match | VerifyOutcome::Skipped | VerifyOutcome::NotApplicable => Ok(()),
            VerifyOutcome::Mismatch {
                frame,
                local,
                remote,
            } => {
                let mut dump = Vec::new();
                if diagnostics::write_desync_dump(
                    &mut dump, frame, local, remote, sim, &self.tracker,
                )
                .is_ok()
                {
                    error!("{}", String::from_utf8_lossy(&dump));
                }
                self.events_out.push_back(SessionEvent::OutOfSync { frame });
                if self.config.continue_on_desync {
                    warn!(frame = %frame, "continuing after divergence (diagnostics mode)");
                    Ok(())
                } else {
                    Err(LockstepError::OutOfSync {
                        frame,
                        local,
                        remote,
                    })
                }
            },
        }
    }
}
