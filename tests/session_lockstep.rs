//! End-to-end tests: two sessions wired together through an in-memory
//! transport, exchanging real datagrams.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bastion_lockstep::{
    add_crc, Cell, ConnectionManager, ContributesChecksum, Event, EventData, Frame, LockstepError,
    LockstepSession, MissionId, OrderFields, ParticipantId, SessionConfig, SessionEvent,
    SessionState, Simulation, StartupStatus, TargetId, TickOutcome,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

type Inbox = Rc<RefCell<VecDeque<(ParticipantId, Vec<u8>)>>>;

/// Loss-free instant-delivery transport: every send lands directly in the
/// other side's inbox.
struct LinkConn {
    local: ParticipantId,
    peers: Vec<(ParticipantId, Inbox)>,
    inbox: Inbox,
}

impl ConnectionManager for LinkConn {
    fn service(&mut self) {}

    fn send(&mut self, buf: &[u8], _require_ack: bool) {
        for (_, inbox) in &self.peers {
            inbox.borrow_mut().push_back((self.local, buf.to_vec()));
        }
    }

    fn try_receive(&mut self) -> Option<(ParticipantId, Vec<u8>)> {
        self.inbox.borrow_mut().pop_front()
    }

    fn num_connections(&self) -> usize {
        self.peers.len()
    }

    fn connection_id(&self, index: usize) -> Option<ParticipantId> {
        self.peers.get(index).map(|p| p.0)
    }

    fn connection_index(&self, id: ParticipantId) -> Option<usize> {
        self.peers.iter().position(|p| p.0 == id)
    }

    fn response_time(&self) -> u32 {
        10
    }

    fn destroy_connection(&mut self, id: ParticipantId) {
        self.peers.retain(|p| p.0 != id);
    }
}

fn linked_pair(a: u8, b: u8) -> (LinkConn, LinkConn) {
    let inbox_a: Inbox = Rc::default();
    let inbox_b: Inbox = Rc::default();
    (
        LinkConn {
            local: ParticipantId::new(a),
            peers: vec![(ParticipantId::new(b), Rc::clone(&inbox_b))],
            inbox: inbox_a.clone(),
        },
        LinkConn {
            local: ParticipantId::new(b),
            peers: vec![(ParticipantId::new(a), inbox_a)],
            inbox: inbox_b,
        },
    )
}

/// A simulation whose state is the log of commands it has executed; the
/// checksum covers the full log, so two machines that executed anything
/// differently disagree from that frame on.
#[derive(Default)]
struct LoggingSim {
    log: Vec<Event>,
    /// When false, commands are silently dropped. Used to force divergence.
    apply: bool,
}

impl LoggingSim {
    fn new() -> Self {
        LoggingSim {
            apply: true,
            ..LoggingSim::default()
        }
    }
}

struct LoggedCommand<'a> {
    event: &'a Event,
}

fn command_key(data: &EventData) -> u32 {
    match data {
        EventData::Mission { subject, .. }
        | EventData::MegaMission { subject, .. }
        | EventData::Sell { subject }
        | EventData::Repair { subject } => subject.0,
        EventData::SpecialPlace { cell, .. } => (u32::from(cell.x) << 16) | u32::from(cell.y),
        _ => 0,
    }
}

impl ContributesChecksum for LoggedCommand<'_> {
    fn add_to(&self, acc: &mut u32) {
        add_crc(acc, self.event.frame.as_i64() as u32);
        add_crc(acc, command_key(&self.event.data));
    }

    fn owner(&self) -> ParticipantId {
        self.event.origin
    }

    fn category(&self) -> &'static str {
        "command"
    }

    fn describe(&self) -> String {
        format!(
            "frame {} key {}",
            self.event.frame,
            command_key(&self.event.data)
        )
    }
}

impl Simulation for LoggingSim {
    fn execute(&mut self, event: &Event) {
        if self.apply {
            self.log.push(event.clone());
        }
    }

    fn for_each_entity(&self, visit: &mut dyn FnMut(&dyn ContributesChecksum)) {
        for event in &self.log {
            visit(&LoggedCommand { event });
        }
    }

    fn rng_state(&self) -> u32 {
        self.log.len() as u32
    }

    fn convert_to_ai(&mut self, _participant: ParticipantId) {}
}

fn test_config() -> SessionConfig {
    SessionConfig {
        look_ahead: 2,
        max_ahead: 10,
        ..SessionConfig::default()
    }
}

fn session(local: u8, remote: u8) -> LockstepSession {
    let mut s = LockstepSession::new(
        ParticipantId::new(local),
        [ParticipantId::new(remote)],
        test_config(),
    );
    s.set_scenario_checksum(0x51de_c0de);
    s
}

fn start_both(
    a: &mut LockstepSession,
    b: &mut LockstepSession,
    conn_a: &mut LinkConn,
    conn_b: &mut LinkConn,
) {
    for _ in 0..10 {
        let sa = a.poll_startup(conn_a).unwrap();
        let sb = b.poll_startup(conn_b).unwrap();
        if sa == StartupStatus::Ready && sb == StartupStatus::Ready {
            return;
        }
    }
    panic!("startup handshake did not complete");
}

#[test]
fn commands_execute_identically_on_both_machines() {
    init_tracing();
    let (mut conn_a, mut conn_b) = linked_pair(0, 1);
    let mut a = session(0, 1);
    let mut b = session(1, 0);
    let mut sim_a = LoggingSim::new();
    let mut sim_b = LoggingSim::new();

    start_both(&mut a, &mut b, &mut conn_a, &mut conn_b);

    // Two compound orders sharing identical fields plus a sell, issued on
    // one machine only.
    let order = OrderFields {
        mission: MissionId(3),
        target: TargetId(0),
        destination: Cell::new(12, 34),
    };
    a.queue_command(EventData::MegaMission {
        subject: TargetId(1),
        order,
    })
    .unwrap();
    a.queue_command(EventData::MegaMission {
        subject: TargetId(2),
        order,
    })
    .unwrap();
    b.queue_command(EventData::Sell {
        subject: TargetId(9),
    })
    .unwrap();

    for _ in 0..20 {
        a.advance(&mut conn_a, &mut sim_a).unwrap();
        b.advance(&mut conn_b, &mut sim_b).unwrap();
    }

    assert!(a.current_frame() >= Frame::new(10));
    assert!(b.current_frame() >= Frame::new(10));

    // Identical command sequence on both machines.
    assert_eq!(sim_a.log.len(), 3);
    assert_eq!(sim_a.log, sim_b.log);

    // The issuing machine executed its own commands on the stamped frame,
    // not immediately: two frames of look-ahead.
    let mega = sim_a
        .log
        .iter()
        .find(|e| matches!(e.data, EventData::MegaMission { .. }))
        .unwrap();
    assert!(mega.frame >= Frame::new(2));

    // Order within a frame follows participant identifiers: machine 0's
    // compound orders before machine 1's sell if they share a frame, and
    // the two compound orders keep their issue order.
    let subjects: Vec<u32> = sim_a
        .log
        .iter()
        .filter_map(|e| match e.data {
            EventData::MegaMission { subject, .. } => Some(subject.0),
            _ => None,
        })
        .collect();
    assert_eq!(subjects, vec![1, 2]);

    // Nobody diverged.
    assert!(a.events().all(|e| !matches!(e, SessionEvent::OutOfSync { .. })));
    assert!(b.events().all(|e| !matches!(e, SessionEvent::OutOfSync { .. })));
}

#[test]
fn gate_stalls_without_peer_traffic_and_recovers() {
    init_tracing();
    let (mut conn_a, mut conn_b) = linked_pair(0, 1);
    let mut a = session(0, 1);
    let mut b = session(1, 0);
    let mut sim_a = LoggingSim::new();
    let mut sim_b = LoggingSim::new();

    start_both(&mut a, &mut b, &mut conn_a, &mut conn_b);

    // Only machine 0 runs; it may move max_ahead frames past the silent
    // peer and must then report Waiting forever.
    let mut advanced = 0;
    for _ in 0..30 {
        match a.advance(&mut conn_a, &mut sim_a).unwrap() {
            TickOutcome::Advanced { .. } => advanced += 1,
            TickOutcome::Waiting => {},
        }
    }
    assert_eq!(advanced, 10);
    assert_eq!(a.current_frame(), Frame::new(10));

    // The peer catches up; machine 0 is released.
    for _ in 0..12 {
        b.advance(&mut conn_b, &mut sim_b).unwrap();
    }
    assert!(matches!(
        a.advance(&mut conn_a, &mut sim_a).unwrap(),
        TickOutcome::Advanced { .. }
    ));
}

#[test]
fn diverging_simulations_are_detected() {
    init_tracing();
    let (mut conn_a, mut conn_b) = linked_pair(0, 1);
    let mut a = session(0, 1);
    let mut b = session(1, 0);
    let mut sim_a = LoggingSim::new();
    // Machine 1 silently drops commands: its state falls out of step the
    // moment the first command executes.
    let mut sim_b = LoggingSim {
        apply: false,
        ..LoggingSim::default()
    };

    start_both(&mut a, &mut b, &mut conn_a, &mut conn_b);

    a.queue_command(EventData::Sell {
        subject: TargetId(5),
    })
    .unwrap();

    let mut detected = None;
    'run: for _ in 0..40 {
        for (session, conn, sim) in [
            (&mut a, &mut conn_a, &mut sim_a),
            (&mut b, &mut conn_b, &mut sim_b),
        ] {
            match session.advance(conn, sim) {
                Ok(_) => {},
                Err(err) => {
                    detected = Some(err);
                    break 'run;
                },
            }
        }
    }

    assert!(matches!(detected, Some(LockstepError::OutOfSync { .. })));
}

#[test]
fn departing_machine_leaves_the_other_running() {
    init_tracing();
    let (mut conn_a, mut conn_b) = linked_pair(0, 1);
    let mut a = session(0, 1);
    let mut b = session(1, 0);
    let mut sim_a = LoggingSim::new();
    let mut sim_b = LoggingSim::new();

    start_both(&mut a, &mut b, &mut conn_a, &mut conn_b);

    for _ in 0..3 {
        a.advance(&mut conn_a, &mut sim_a).unwrap();
        b.advance(&mut conn_b, &mut sim_b).unwrap();
    }

    // Machine 0 signs off; machine 1 must absorb the departure and then
    // free-run without a gate.
    a.stop(&mut conn_a);
    assert_eq!(a.state(), SessionState::Stopped);

    for _ in 0..20 {
        b.advance(&mut conn_b, &mut sim_b).unwrap();
    }
    assert_eq!(b.remote_peers(), 0);
    let events: Vec<_> = b.events().collect();
    assert!(events.contains(&SessionEvent::PeerLeft {
        id: ParticipantId::new(0)
    }));
    assert!(b.current_frame() > Frame::new(10));
}

#[test]
fn scenario_mismatch_aborts_startup_on_both_sides() {
    init_tracing();
    let (mut conn_a, mut conn_b) = linked_pair(0, 1);
    let mut a = session(0, 1);
    let mut b = LockstepSession::new(
        ParticipantId::new(1),
        [ParticipantId::new(0)],
        test_config(),
    );
    b.set_scenario_checksum(0xffff_ffff); // a different map

    // Machine 0 announces first; machine 1 sees the wrong checksum.
    assert!(matches!(
        a.poll_startup(&mut conn_a),
        Ok(StartupStatus::Waiting { .. })
    ));
    assert_eq!(
        b.poll_startup(&mut conn_b),
        Err(LockstepError::ScenarioMismatch {
            origin: ParticipantId::new(0)
        })
    );
}
