//! Datagram building and parsing.
//!
//! A datagram always begins with a keep-alive record asserting the sender's
//! frame position, rolling checksum, claimed sent-count, and look-ahead
//! delay. Command records follow, laid out by one of two strategies that
//! both sides of a session agree on in configuration:
//!
//! * [`Strategy::Uncompressed`]: every record carries its own frame and
//!   origin stamp.
//! * [`Strategy::Compressed`]: the stamp is carried once in the leading
//!   keep-alive and shared by every following record, and consecutive
//!   compound orders with identical shared fields are merged into a single
//!   run record.
//!
//! Building is capacity-bounded: when the next record no longer fits in the
//! output buffer the datagram is closed out and the remaining events stay
//! queued for the next one.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::do_list::DoList;
use crate::error::LockstepError;
use crate::event::{Event, EventData, OrderFields, SyncHeader, TargetId};
use crate::network::codec::{self, CodecError, CodecResult};
use crate::{Frame, ParticipantId};

/// How command records are laid out in a datagram. Both sides of a session
/// must configure the same strategy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Every record carries its own frame and origin stamp.
    Uncompressed,
    /// The stamp is shared from the leading keep-alive and compound-order
    /// runs are merged.
    Compressed,
}

/// One byte identifying the record kind that follows.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum RecordTag {
    Mission = 0,
    MegaMission = 1,
    MegaMissionRun = 2,
    Sell = 3,
    Repair = 4,
    SpecialPlace = 5,
    AddParticipant = 6,
    FrameInfo = 7,
    FrameRateChange = 8,
    ProcessTime = 9,
    Exit = 10,
    Options = 11,
}

impl TryFrom<u8> for RecordTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => RecordTag::Mission,
            1 => RecordTag::MegaMission,
            2 => RecordTag::MegaMissionRun,
            3 => RecordTag::Sell,
            4 => RecordTag::Repair,
            5 => RecordTag::SpecialPlace,
            6 => RecordTag::AddParticipant,
            7 => RecordTag::FrameInfo,
            8 => RecordTag::FrameRateChange,
            9 => RecordTag::ProcessTime,
            10 => RecordTag::Exit,
            11 => RecordTag::Options,
            other => return Err(other),
        })
    }
}

fn tag_for(data: &EventData, strategy: Strategy) -> RecordTag {
    match data {
        EventData::Mission { .. } => RecordTag::Mission,
        EventData::MegaMission { .. } => match strategy {
            Strategy::Uncompressed => RecordTag::MegaMission,
            Strategy::Compressed => RecordTag::MegaMissionRun,
        },
        EventData::Sell { .. } => RecordTag::Sell,
        EventData::Repair { .. } => RecordTag::Repair,
        EventData::SpecialPlace { .. } => RecordTag::SpecialPlace,
        EventData::AddParticipant { .. } => RecordTag::AddParticipant,
        EventData::FrameInfo(_) => RecordTag::FrameInfo,
        EventData::FrameRateChange { .. } => RecordTag::FrameRateChange,
        EventData::ProcessTime { .. } => RecordTag::ProcessTime,
        EventData::Exit => RecordTag::Exit,
        EventData::Options => RecordTag::Options,
    }
}

/// The keep-alive record leading every datagram: the sender's stamp plus
/// its synchronization header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// The frame the sender's events in this datagram are scheduled for
    /// (the sender's current frame plus its look-ahead delay).
    pub frame: Frame,
    /// The sending participant.
    pub origin: ParticipantId,
    /// Checksum, claimed sent-count, and look-ahead delay.
    pub sync: SyncHeader,
}

/// Result of building one datagram.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EncodeOutcome {
    /// Bytes written to the output buffer.
    pub bytes: usize,
    /// How many of the offered events made it into the datagram. The
    /// remainder did not fit and must be offered again next flush.
    pub events_written: usize,
}

/// Result of parsing one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeOutcome {
    /// Command records queued into the execution queue (keep-alives are not
    /// commands and are not counted).
    pub commands: usize,
    /// Every keep-alive header found, in order. Normally exactly one.
    pub headers: SmallVec<[PacketHeader; 1]>,
}

struct Cursor<'a> {
    out: &'a mut [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Cursor { out, offset: 0 }
    }

    /// Writes one value at the current offset. `BufferTooSmall` leaves the
    /// offset untouched so the caller can roll the record back.
    fn write<T: Serialize>(&mut self, value: &T) -> CodecResult<()> {
        let written = codec::encode_into(value, &mut self.out[self.offset..])?;
        self.offset += written;
        Ok(())
    }
}

fn write_stamped_header(cursor: &mut Cursor<'_>, header: &PacketHeader) -> CodecResult<()> {
    cursor.write(&(RecordTag::FrameInfo as u8))?;
    cursor.write(header)
}

/// Encodes the payload fields of a single non-run record.
fn write_fields(cursor: &mut Cursor<'_>, data: &EventData) -> CodecResult<()> {
    match data {
        EventData::Mission { subject, order } | EventData::MegaMission { subject, order } => {
            cursor.write(subject)?;
            cursor.write(order)
        },
        EventData::Sell { subject } | EventData::Repair { subject } => cursor.write(subject),
        EventData::SpecialPlace { weapon, cell } => {
            cursor.write(weapon)?;
            cursor.write(cell)
        },
        EventData::AddParticipant { payload } => cursor.write(payload),
        EventData::FrameInfo(sync) => cursor.write(sync),
        EventData::FrameRateChange { delay } => cursor.write(delay),
        EventData::ProcessTime { average_ticks } => cursor.write(average_ticks),
        EventData::Exit | EventData::Options => Ok(()),
    }
}

/// Builds one datagram: the keep-alive header first, then as many of
/// `events` as fit, up to `max_events`.
///
/// Compressed datagrams require every offered event to carry the header's
/// stamp; the session guarantees this by stamping at flush time.
///
/// # Errors
///
/// Fails only when the buffer cannot even hold the keep-alive header,
/// which is a configuration fault. Running out of room for command records
/// is not an error; the datagram is closed out early and
/// [`EncodeOutcome::events_written`] reports the shortfall.
pub fn encode_packet(
    out: &mut [u8],
    strategy: Strategy,
    header: &PacketHeader,
    events: &[Event],
    max_events: usize,
) -> CodecResult<EncodeOutcome> {
    let mut cursor = Cursor::new(out);
    write_stamped_header(&mut cursor, header)?;

    let mut written = 0;
    let mut index = 0;
    'build: while index < events.len() && written < max_events {
        let event = &events[index];
        debug_assert!(
            strategy == Strategy::Uncompressed
                || (event.frame == header.frame && event.origin == header.origin)
        );

        let record_start = cursor.offset;
        if strategy == Strategy::Compressed {
            if let EventData::MegaMission { order, .. } = &event.data {
                // Run record: tag, repeat count, shared fields once, then
                // one subject per merged event. The count is patched in
                // after we know how many subjects fit.
                let shared = *order;
                if cursor.write(&(RecordTag::MegaMissionRun as u8)).is_err() {
                    break 'build;
                }
                let count_pos = cursor.offset;
                if cursor.write(&0u8).is_err() || cursor.write(&shared).is_err() {
                    cursor.offset = record_start;
                    break 'build;
                }
                let mut count: u8 = 0;
                while index < events.len() && written < max_events && count < u8::MAX {
                    let EventData::MegaMission { subject, order } = &events[index].data else {
                        break;
                    };
                    if *order != shared || cursor.write(subject).is_err() {
                        break;
                    }
                    count += 1;
                    index += 1;
                    written += 1;
                }
                if count == 0 {
                    cursor.offset = record_start;
                    break 'build;
                }
                cursor.out[count_pos] = count;
                continue 'build;
            }
        }

        let fits = (|| -> CodecResult<()> {
            cursor.write(&(tag_for(&event.data, strategy) as u8))?;
            if strategy == Strategy::Uncompressed || event.data.is_frame_info() {
                cursor.write(&event.frame)?;
                cursor.write(&event.origin)?;
            }
            write_fields(&mut cursor, &event.data)
        })();
        match fits {
            Ok(()) => {
                index += 1;
                written += 1;
            },
            Err(CodecError::BufferTooSmall { .. }) => {
                cursor.offset = record_start;
                break 'build;
            },
            Err(other) => return Err(other),
        }
    }

    Ok(EncodeOutcome {
        bytes: cursor.offset,
        events_written: written,
    })
}

fn malformed(err: &CodecError) -> LockstepError {
    LockstepError::MalformedPacket {
        context: err.to_string(),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, offset: 0 }
    }

    fn done(&self) -> bool {
        self.offset >= self.buf.len()
    }

    fn read<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, LockstepError> {
        let (value, consumed) =
            codec::decode::<T>(&self.buf[self.offset..]).map_err(|e| malformed(&e))?;
        self.offset += consumed;
        Ok(value)
    }
}

/// Parses one datagram and queues its events into `do_list`.
///
/// Keep-alive headers are returned in [`DecodeOutcome::headers`]; a
/// keep-alive for a frame past zero is also queued as a pseudo-event so its
/// checksum is validated when that frame executes. Startup keep-alives
/// (frame zero) are not queued; the session validates their checksum
/// against the scenario directly.
///
/// # Errors
///
/// [`LockstepError::MalformedPacket`] on unknown tags, truncation, or
/// records that violate the strategy's layout;
/// [`LockstepError::QueueFull`] if the execution queue overflows, which is
/// fatal to the session.
pub fn decode_packet(
    buf: &[u8],
    strategy: Strategy,
    do_list: &mut DoList,
) -> Result<DecodeOutcome, LockstepError> {
    let mut reader = Reader::new(buf);
    let mut headers: SmallVec<[PacketHeader; 1]> = SmallVec::new();
    let mut commands = 0usize;
    // Compressed records inherit the stamp of the leading keep-alive.
    let mut stamp: Option<(Frame, ParticipantId)> = None;

    while !reader.done() {
        let tag_byte: u8 = reader.read()?;
        let tag = RecordTag::try_from(tag_byte).map_err(|byte| LockstepError::MalformedPacket {
            context: format!("unknown record tag {byte:#04x}"),
        })?;

        if tag == RecordTag::FrameInfo {
            let header: PacketHeader = reader.read()?;
            if stamp.is_none() {
                stamp = Some((header.frame, header.origin));
            }
            if header.frame > Frame::ZERO {
                do_list.push(Event::new(
                    header.origin,
                    header.frame,
                    EventData::FrameInfo(header.sync),
                ))?;
            }
            headers.push(header);
            continue;
        }

        let (frame, origin) = match strategy {
            Strategy::Uncompressed => {
                let frame: Frame = reader.read()?;
                let origin: ParticipantId = reader.read()?;
                (frame, origin)
            },
            Strategy::Compressed => stamp.ok_or_else(|| LockstepError::MalformedPacket {
                context: "command record before the keep-alive header".to_owned(),
            })?,
        };

        if tag == RecordTag::MegaMissionRun {
            if strategy != Strategy::Compressed {
                return Err(LockstepError::MalformedPacket {
                    context: "run record in an uncompressed datagram".to_owned(),
                });
            }
            let count: u8 = reader.read()?;
            if count == 0 {
                return Err(LockstepError::MalformedPacket {
                    context: "run record with zero subjects".to_owned(),
                });
            }
            let order: OrderFields = reader.read()?;
            for _ in 0..count {
                let subject: TargetId = reader.read()?;
                do_list.push(Event::new(
                    origin,
                    frame,
                    EventData::MegaMission { subject, order },
                ))?;
                commands += 1;
            }
            continue;
        }

        let data = match tag {
            RecordTag::Mission => EventData::Mission {
                subject: reader.read()?,
                order: reader.read()?,
            },
            RecordTag::MegaMission => EventData::MegaMission {
                subject: reader.read()?,
                order: reader.read()?,
            },
            RecordTag::Sell => EventData::Sell {
                subject: reader.read()?,
            },
            RecordTag::Repair => EventData::Repair {
                subject: reader.read()?,
            },
            RecordTag::SpecialPlace => EventData::SpecialPlace {
                weapon: reader.read()?,
                cell: reader.read()?,
            },
            RecordTag::AddParticipant => EventData::AddParticipant {
                payload: reader.read()?,
            },
            RecordTag::FrameRateChange => EventData::FrameRateChange {
                delay: reader.read()?,
            },
            RecordTag::ProcessTime => EventData::ProcessTime {
                average_ticks: reader.read()?,
            },
            RecordTag::Exit => EventData::Exit,
            RecordTag::Options => EventData::Options,
            RecordTag::FrameInfo | RecordTag::MegaMissionRun => unreachable!(),
        };
        do_list.push(Event::new(origin, frame, data))?;
        commands += 1;
    }

    Ok(DecodeOutcome { commands, headers })
}
