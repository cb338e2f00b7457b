//! Reassembly of sections from the packets of one or more PIDs.

use super::{RawSection, SectionCommonHeader, SectionError, SectionKey};
use crate::packet::{ContinuityCounter, Packet, Pid};
use fixedbitset::FixedBitSet;
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet};
use std::ops::{AddAssign, RangeInclusive};

/// Largest `section_length` of any section type we accept (private sections and EIT).
const SECTION_LIMIT: usize = 4093;

/// The table ids a watched PID should deliver.  Sections with other table ids are dropped before
/// any further validation.
#[derive(Clone, Debug)]
pub struct TableFilter {
    table_ids: FixedBitSet,
}

impl TableFilter {
    pub fn all() -> TableFilter {
        let mut table_ids = FixedBitSet::with_capacity(256);
        table_ids.insert_range(..);
        TableFilter { table_ids }
    }

    pub fn only(ids: &[u8]) -> TableFilter {
        let mut table_ids = FixedBitSet::with_capacity(256);
        for &id in ids {
            table_ids.insert(id as usize);
        }
        TableFilter { table_ids }
    }

    pub fn range(ids: RangeInclusive<u8>) -> TableFilter {
        let mut table_ids = FixedBitSet::with_capacity(256);
        table_ids.insert_range(*ids.start() as usize..*ids.end() as usize + 1);
        TableFilter { table_ids }
    }

    /// Add the table ids of `other` to this filter.
    pub fn union(mut self, other: &TableFilter) -> TableFilter {
        self.table_ids.union_with(&other.table_ids);
        self
    }

    pub fn accepts(&self, table_id: u8) -> bool {
        self.table_ids.contains(table_id as usize)
    }
}

/// Counters describing everything the reassembler has seen; these are diagnostics, never errors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// packets presented for a watched PID
    pub packets: u64,
    /// sections emitted
    pub sections: u64,
    /// sections dropped because their `SectionKey` had already been emitted this cycle
    pub duplicates: u64,
    pub crc_failures: u64,
    /// continuity counter gaps which caused a partial section to be discarded
    pub discontinuities: u64,
    /// sections dropped by the `TableFilter`
    pub filtered: u64,
    /// sections with `current_next_indicator` of 'next'
    pub not_current: u64,
    /// structurally broken sections (bad length, bad pointer, truncated by a new section start)
    pub malformed: u64,
}

impl AddAssign for ReassemblyStats {
    fn add_assign(&mut self, rhs: ReassemblyStats) {
        self.packets += rhs.packets;
        self.sections += rhs.sections;
        self.duplicates += rhs.duplicates;
        self.crc_failures += rhs.crc_failures;
        self.discontinuities += rhs.discontinuities;
        self.filtered += rhs.filtered;
        self.not_current += rhs.not_current;
        self.malformed += rhs.malformed;
    }
}

struct PidState {
    filter: TableFilter,
    last_cc: Option<ContinuityCounter>,
    // bytes of a section (or sections) whose start has been seen, but whose end has not
    buf: Vec<u8>,
}

impl PidState {
    fn reset(&mut self) {
        self.buf.clear();
    }
}

/// Receives complete sections, applying validation and deduplication.
struct SectionSink {
    seen: HashSet<SectionKey>,
    stats: ReassemblyStats,
    out: Vec<RawSection>,
}

impl SectionSink {
    fn section(&mut self, pid: Pid, filter: &TableFilter, data: &[u8]) {
        if !filter.accepts(data[0]) {
            self.stats.filtered += 1;
            return;
        }
        match RawSection::parse(pid, data) {
            Ok(raw) => {
                if self.seen.insert(raw.key()) {
                    trace!("new section {:?}", raw);
                    self.stats.sections += 1;
                    self.out.push(raw);
                } else {
                    self.stats.duplicates += 1;
                }
            }
            Err(e @ SectionError::CrcMismatch { .. }) => {
                debug!("{:?} table_id {:#04x}: {}", pid, data[0], e);
                self.stats.crc_failures += 1;
            }
            Err(SectionError::NotCurrent) => {
                self.stats.not_current += 1;
            }
            Err(e) => {
                debug!("{:?} table_id {:#04x}: {}", pid, data[0], e);
                self.stats.malformed += 1;
            }
        }
    }
}

/// Demultiplexes packets of the watched PIDs into complete sections.
///
/// ```
/// # use mpeg2ts_epg::packet::{Packet, Pid};
/// # use mpeg2ts_epg::psi::{SectionReassembler, TableFilter};
/// # let packets: Vec<[u8; 188]> = vec![];
/// let mut reassembler = SectionReassembler::new();
/// reassembler.watch(Pid::EIT, TableFilter::range(0x4e..=0x6f));
/// for buf in &packets {
///     for section in reassembler.feed(&Packet::new(&buf[..])) {
///         println!("{:?}", section);
///     }
/// }
/// ```
pub struct SectionReassembler {
    pids: HashMap<Pid, PidState>,
    sink: SectionSink,
}

impl Default for SectionReassembler {
    fn default() -> Self {
        SectionReassembler::new()
    }
}

impl SectionReassembler {
    pub fn new() -> SectionReassembler {
        SectionReassembler {
            pids: HashMap::new(),
            sink: SectionSink {
                seen: HashSet::new(),
                stats: ReassemblyStats::default(),
                out: vec![],
            },
        }
    }

    /// Start collecting sections with the given table ids from `pid`.  Replaces any existing
    /// filter for that PID, discarding partially received data.
    pub fn watch(&mut self, pid: Pid, filter: TableFilter) {
        self.pids.insert(
            pid,
            PidState {
                filter,
                last_cc: None,
                buf: Vec::new(),
            },
        );
    }

    pub fn unwatch(&mut self, pid: Pid) {
        self.pids.remove(&pid);
    }

    pub fn watched(&self) -> impl Iterator<Item = Pid> + '_ {
        self.pids.keys().copied()
    }

    /// Forget which sections have already been emitted, so that the next repeat of each will be
    /// emitted again.
    pub fn reset_cycle(&mut self) {
        self.sink.seen.clear();
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.sink.stats
    }

    /// Process one packet, returning any sections it completed.  Packets for PIDs that are not
    /// being watched are ignored.
    pub fn feed(&mut self, pk: &Packet<'_>) -> std::vec::Drain<'_, RawSection> {
        let pid = pk.pid();
        if let Some(state) = self.pids.get_mut(&pid) {
            self.sink.stats.packets += 1;
            Self::consume(state, &mut self.sink, pid, pk);
        }
        self.sink.out.drain(..)
    }

    fn consume(state: &mut PidState, sink: &mut SectionSink, pid: Pid, pk: &Packet<'_>) {
        if !pk.adaptation_control().has_payload() {
            // continuity_counter does not advance for packets without payload
            return;
        }
        if pk.transport_error_indicator() {
            // treated as lost, so the next good packet shows up as a discontinuity
            return;
        }
        let cc = pk.continuity_counter();
        if let Some(last) = state.last_cc {
            if cc == last {
                // a permitted duplicate packet
                return;
            }
            if !cc.follows(last) && !pk.discontinuity_indicator() {
                let err = SectionError::DiscontinuityDetected {
                    pid,
                    last: last.count(),
                    actual: cc.count(),
                };
                debug!("{}", err);
                sink.stats.discontinuities += 1;
                state.reset();
            }
        }
        state.last_cc = Some(cc);

        let payload = match pk.payload() {
            Some(p) => p,
            None => return,
        };
        if pk.payload_unit_start_indicator() {
            let pointer = payload[0] as usize;
            let data = &payload[1..];
            if pointer > data.len() {
                let err = SectionError::PointerOutOfRange {
                    pointer,
                    available: data.len(),
                };
                warn!("{:?}: {}", pid, err);
                sink.stats.malformed += 1;
                state.reset();
                return;
            }
            if !state.buf.is_empty() {
                state.buf.extend_from_slice(&data[..pointer]);
                Self::emit_complete(state, sink, pid);
                if !state.buf.is_empty() {
                    // the previous section should have ended where this one starts
                    sink.stats.malformed += 1;
                    state.reset();
                }
            }
            state.buf.extend_from_slice(&data[pointer..]);
            Self::emit_complete(state, sink, pid);
        } else if !state.buf.is_empty() {
            state.buf.extend_from_slice(payload);
            Self::emit_complete(state, sink, pid);
        }
    }

    /// Emit every whole section at the front of the buffer, leaving any incomplete trailing
    /// section in place.
    fn emit_complete(state: &mut PidState, sink: &mut SectionSink, pid: Pid) {
        let mut pos = 0;
        loop {
            let rest = &state.buf[pos..];
            if rest.is_empty() {
                break;
            }
            if rest[0] == 0xff {
                // stuffing; nothing else follows in this packet
                pos = state.buf.len();
                break;
            }
            if rest.len() < SectionCommonHeader::SIZE {
                break;
            }
            let header = SectionCommonHeader::new(rest);
            if header.section_length > SECTION_LIMIT {
                let err = SectionError::SectionTooLong {
                    length: header.section_length,
                    limit: SECTION_LIMIT,
                };
                debug!("{:?}: {}", pid, err);
                sink.stats.malformed += 1;
                pos = state.buf.len();
                break;
            }
            let total = header.total_length();
            if rest.len() < total {
                break;
            }
            sink.section(pid, &state.filter, &rest[..total]);
            pos += total;
        }
        state.buf.drain(..pos);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::psi::packetise;

    fn feed_all(r: &mut SectionReassembler, packets: &[Vec<u8>]) -> Vec<RawSection> {
        let mut out = vec![];
        for p in packets {
            out.extend(r.feed(&Packet::new(&p[..])));
        }
        out
    }

    #[test]
    fn single_packet_section() {
        let sect = RawSection::long(Pid::EIT, 0x4e, 1, 0, 0, 0, b"hello");
        let mut r = SectionReassembler::new();
        r.watch(Pid::EIT, TableFilter::range(0x4e..=0x6f));
        let out = feed_all(&mut r, &packetise(Pid::EIT, &sect.to_bytes(), 0));
        assert_eq!(out, vec![sect]);
        assert_eq!(r.stats().sections, 1);
    }

    #[test]
    fn section_spanning_packets() {
        let payload: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let sect = RawSection::long(Pid::EIT, 0x50, 1, 0, 0, 0, &payload[..]);
        let packets = packetise(Pid::EIT, &sect.to_bytes(), 5);
        assert_eq!(packets.len(), 4);
        let mut r = SectionReassembler::new();
        r.watch(Pid::EIT, TableFilter::all());
        let out = feed_all(&mut r, &packets);
        assert_eq!(out, vec![sect]);
    }

    #[test]
    fn several_sections_in_one_packet() {
        let pid = Pid::new(0xd2);
        let a = RawSection::short(pid, 0x90, b"first");
        let b = RawSection::short(pid, 0x90, b"second");
        let mut joined = a.to_bytes();
        joined.extend(b.to_bytes());
        let mut r = SectionReassembler::new();
        r.watch(pid, TableFilter::only(&[0x90]));
        let out = feed_all(&mut r, &packetise(pid, &joined, 0));
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn duplicates_dropped_within_cycle() {
        let sect = RawSection::long(Pid::EIT, 0x4e, 1, 0, 0, 0, b"x").to_bytes();
        let mut r = SectionReassembler::new();
        r.watch(Pid::EIT, TableFilter::all());
        let mut cc = 0;
        let mut out = vec![];
        for _ in 0..5 {
            out.extend(feed_all(&mut r, &packetise(Pid::EIT, &sect, cc)));
            cc = (cc + 1) & 0xf;
        }
        assert_eq!(out.len(), 1);
        assert_eq!(r.stats().duplicates, 4);
        r.reset_cycle();
        assert_eq!(feed_all(&mut r, &packetise(Pid::EIT, &sect, cc)).len(), 1);
    }

    #[test]
    fn discontinuity_discards_partial() {
        let payload = vec![0x55u8; 400];
        let sect = RawSection::long(Pid::EIT, 0x4e, 1, 0, 0, 0, &payload[..]);
        let mut packets = packetise(Pid::EIT, &sect.to_bytes(), 0);
        // lose the middle packet
        packets.remove(1);
        let mut r = SectionReassembler::new();
        r.watch(Pid::EIT, TableFilter::all());
        let out = feed_all(&mut r, &packets);
        assert!(out.is_empty());
        assert_eq!(r.stats().discontinuities, 1);
        assert_eq!(r.stats().crc_failures, 0);
    }

    #[test]
    fn errored_packet_treated_as_lost() {
        let payload = vec![0x55u8; 400];
        let sect = RawSection::long(Pid::EIT, 0x4e, 1, 0, 0, 0, &payload[..]);
        let mut packets = packetise(Pid::EIT, &sect.to_bytes(), 0);
        packets[1][1] |= 0b1000_0000; // transport_error_indicator
        let mut r = SectionReassembler::new();
        r.watch(Pid::EIT, TableFilter::all());
        assert!(feed_all(&mut r, &packets).is_empty());
        assert_eq!(r.stats().discontinuities, 1);
    }

    #[test]
    fn signalled_discontinuity_is_not_counted() {
        let sect = RawSection::long(Pid::EIT, 0x4e, 1, 0, 0, 0, b"x").to_bytes();
        let mut r = SectionReassembler::new();
        r.watch(Pid::EIT, TableFilter::all());
        feed_all(&mut r, &packetise(Pid::EIT, &sect, 0));
        let mut packets = packetise(Pid::EIT, &sect, 9);
        // add an adaptation field carrying discontinuity_indicator, shifting the payload along
        let pk = &mut packets[0];
        pk[3] = 0b0011_0000 | 9;
        pk.insert(4, 1); // adaptation_field_length
        pk.insert(5, 0b1000_0000); // discontinuity_indicator
        pk.truncate(Packet::SIZE);
        let out = feed_all(&mut r, &packets);
        assert_eq!(r.stats().discontinuities, 0);
        assert!(out.is_empty(), "same key as the first, so a duplicate");
        assert_eq!(r.stats().duplicates, 1);
    }

    #[test]
    fn crc_failure_counted() {
        let mut sect = RawSection::long(Pid::EIT, 0x4e, 1, 0, 0, 0, b"x").to_bytes();
        sect[8] ^= 0x01;
        let mut r = SectionReassembler::new();
        r.watch(Pid::EIT, TableFilter::all());
        assert!(feed_all(&mut r, &packetise(Pid::EIT, &sect, 0)).is_empty());
        assert_eq!(r.stats().crc_failures, 1);
    }

    #[test]
    fn filter_and_unwatched_pid() {
        let sect = RawSection::long(Pid::EIT, 0x4e, 1, 0, 0, 0, b"x").to_bytes();
        let mut r = SectionReassembler::new();
        r.watch(Pid::EIT, TableFilter::only(&[0x50]));
        assert!(feed_all(&mut r, &packetise(Pid::EIT, &sect, 0)).is_empty());
        assert_eq!(r.stats().filtered, 1);
        assert!(feed_all(&mut r, &packetise(Pid::SDT_BAT, &sect, 0)).is_empty());
        assert_eq!(r.stats().packets, 1);
    }

    #[test]
    fn pointer_field_completes_previous_section() {
        let pid = Pid::EIT;
        let a = RawSection::long(pid, 0x4e, 1, 0, 0, 0, &[0xaa; 180][..]).to_bytes();
        let b = RawSection::long(pid, 0x4e, 2, 0, 0, 0, b"bb").to_bytes();
        // a is 192 bytes, 183 of which fit in the first packet after the pointer_field
        let mut packets = packetise(pid, &a, 0);
        assert_eq!(packets.len(), 2);
        let tail = a.len() - 183;
        let second = &mut packets[1];
        second[1] |= 0b0100_0000;
        let mut body = vec![tail as u8];
        body.extend_from_slice(&a[183..]);
        body.extend_from_slice(&b);
        second[4..4 + body.len()].copy_from_slice(&body);
        for byte in second[4 + body.len()..].iter_mut() {
            *byte = 0xff;
        }
        let mut r = SectionReassembler::new();
        r.watch(pid, TableFilter::all());
        let out = feed_all(&mut r, &packets);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].table_id_extension, 2);
    }
}
