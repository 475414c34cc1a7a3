//! Human-readable dumps written when the lockstep contract is broken.
//!
//! A divergence or a fatally late packet cannot be repaired, but it can be
//! diagnosed: each machine writes a dump of its view of the world, and the
//! dumps from two machines are compared offline to find the first field
//! that disagrees. Rows are grouped by owning participant and then by
//! entity category so dumps from different machines diff cleanly.

use std::collections::BTreeMap;
use std::io;

use crate::do_list::DoList;
use crate::peer_sync::SyncTracker;
use crate::sim::Simulation;
use crate::{Frame, ParticipantId};

fn write_peer_rows<W: io::Write>(out: &mut W, tracker: &SyncTracker) -> io::Result<()> {
    writeln!(out, "peers:")?;
    for peer in tracker.iter() {
        writeln!(
            out,
            "  participant {}: frame {}, claims sent {}, received {}, ready {}",
            peer.id, peer.remote_frame, peer.remote_sent, peer.received, peer.ready
        )?;
    }
    Ok(())
}

fn write_entity_rows<W: io::Write>(out: &mut W, sim: &dyn Simulation) -> io::Result<()> {
    // Group rows by owner, then category, independent of the simulation's
    // traversal order.
    let mut grouped: BTreeMap<ParticipantId, BTreeMap<&'static str, Vec<String>>> = BTreeMap::new();
    sim.for_each_entity(&mut |entity| {
        grouped
            .entry(entity.owner())
            .or_default()
            .entry(entity.category())
            .or_default()
            .push(entity.describe());
    });

    for (owner, categories) in &grouped {
        writeln!(out, "participant {}:", owner)?;
        for (category, rows) in categories {
            writeln!(out, "  {}:", category)?;
            for row in rows {
                writeln!(out, "    {}", row)?;
            }
        }
    }
    writeln!(out, "rng state: {:#010x}", sim.rng_state())?;
    Ok(())
}

/// Writes the divergence dump: the disagreeing checksums, every entity's
/// checksummed state grouped by owner and category, the random-number
/// generator state, and the peer tracker.
///
/// # Errors
///
/// Propagates I/O errors from `out`.
pub fn write_desync_dump<W: io::Write>(
    out: &mut W,
    frame: Frame,
    local: u32,
    remote: u32,
    sim: &dyn Simulation,
    tracker: &SyncTracker,
) -> io::Result<()> {
    writeln!(out, "=== OUT OF SYNC at frame {} ===", frame)?;
    writeln!(
        out,
        "local checksum {:#010x}, remote checksum {:#010x}",
        local, remote
    )?;
    write_entity_rows(out, sim)?;
    write_peer_rows(out, tracker)
}

/// Writes the late-packet dump: the offending event's origin and frames,
/// the full execution queue, and the peer tracker.
///
/// # Errors
///
/// Propagates I/O errors from `out`.
pub fn write_lateness_dump<W: io::Write>(
    out: &mut W,
    origin: ParticipantId,
    scheduled: Frame,
    current: Frame,
    do_list: &DoList,
    tracker: &SyncTracker,
) -> io::Result<()> {
    writeln!(
        out,
        "=== PACKET TOO LATE: participant {} scheduled frame {}, current frame {} ===",
        origin, scheduled, current
    )?;
    writeln!(out, "execution queue ({} entries):", do_list.len())?;
    for (index, event) in do_list.iter().enumerate() {
        writeln!(
            out,
            "  [{}] origin {} frame {} executed {} {:?}",
            index, event.origin, event.frame, event.executed, event.data
        )?;
    }
    write_peer_rows(out, tracker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::ContributesChecksum;
    use crate::event::{Event, EventData, TargetId};

    struct Soldier {
        owner: u8,
        x: u16,
        y: u16,
    }

    impl ContributesChecksum for Soldier {
        fn add_to(&self, acc: &mut u32) {
            crate::crc::add_crc(acc, u32::from(self.x));
            crate::crc::add_crc(acc, u32::from(self.y));
        }

        fn owner(&self) -> ParticipantId {
            ParticipantId::new(self.owner)
        }

        fn category(&self) -> &'static str {
            "infantry"
        }

        fn describe(&self) -> String {
            format!("soldier at ({}, {})", self.x, self.y)
        }
    }

    struct TwoSoldiers;

    impl Simulation for TwoSoldiers {
        fn execute(&mut self, _event: &Event) {}

        fn for_each_entity(&self, visit: &mut dyn FnMut(&dyn ContributesChecksum)) {
            // Deliberately visited in reverse owner order; the dump must
            // still group by owner ascending.
            visit(&Soldier {
                owner: 2,
                x: 5,
                y: 6,
            });
            visit(&Soldier {
                owner: 1,
                x: 3,
                y: 4,
            });
        }

        fn rng_state(&self) -> u32 {
            0xabcd
        }

        fn convert_to_ai(&mut self, _participant: ParticipantId) {}
    }

    #[test]
    fn desync_dump_groups_by_owner() {
        let mut buf = Vec::new();
        let tracker = SyncTracker::new([ParticipantId::new(2)]);
        write_desync_dump(
            &mut buf,
            Frame::new(35),
            0x1111,
            0x2222,
            &TwoSoldiers,
            &tracker,
        )
        .unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("OUT OF SYNC at frame 35"));
        assert!(text.contains("0x00001111"));
        assert!(text.contains("0x00002222"));
        // Owner 1 appears before owner 2 despite reverse traversal.
        let p1 = text.find("participant 1:").unwrap();
        let p2 = text.find("participant 2:").unwrap();
        assert!(p1 < p2);
        assert!(text.contains("soldier at (3, 4)"));
        assert!(text.contains("rng state"));
        assert!(text.contains("peers:"));
    }

    #[test]
    fn lateness_dump_lists_queue() {
        let mut buf = Vec::new();
        let mut list = DoList::with_capacity(4);
        list.push(Event::new(
            ParticipantId::new(3),
            Frame::new(40),
            EventData::Sell {
                subject: TargetId(7),
            },
        ))
        .unwrap();
        let tracker = SyncTracker::new([ParticipantId::new(3)]);

        write_lateness_dump(
            &mut buf,
            ParticipantId::new(3),
            Frame::new(40),
            Frame::new(45),
            &list,
            &tracker,
        )
        .unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("PACKET TOO LATE"));
        assert!(text.contains("scheduled frame 40"));
        assert!(text.contains("current frame 45"));
        assert!(text.contains("execution queue (1 entries):"));
        assert!(text.contains("origin 3 frame 40"));
    }
}
