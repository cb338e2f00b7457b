//! Types for turning transport stream packets into the *sections* that carry guide tables.
//!
//! # Concepts
//!
//! * A guide *Table* (a channel list, a day of event titles) is split into *Sections*
//! * A Section can be split across a small number of individual transport stream *Packets*, and
//!   several short sections may share one packet
//! * Most tables use the 'long form' section syntax, which carries a
//!   [`TableSyntaxHeader`](struct.TableSyntaxHeader.html) and a trailing CRC.  Some proprietary
//!   guide formats (MediaHighway) use the 'short form', which has neither.
//!
//! # Core types
//!
//! * [`SectionReassembler`](reassemble/struct.SectionReassembler.html) converts *Packets* into
//!   validated, deduplicated [`RawSection`](struct.RawSection.html) values
//! * [`SectionKey`](struct.SectionKey.html) identifies a section for deduplication

pub mod reassemble;

pub use self::reassemble::{ReassemblyStats, SectionReassembler, TableFilter};

use crate::packet::Pid;
use crc::{Crc, CRC_32_MPEG_2};
use std::fmt;

const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// CRC-32/MPEG-2 of the given bytes, as used by the `CRC_32` field of long form sections.
pub fn crc32(data: &[u8]) -> u32 {
    CRC_MPEG.checksum(data)
}

/// Reasons a candidate section was discarded.  These are counted in
/// [`ReassemblyStats`](reassemble/struct.ReassemblyStats.html) rather than being returned to
/// callers, since broadcast noise is expected.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum SectionError {
    /// The `CRC_32` carried in the section does not match the section content.
    #[error("crc mismatch (computed {computed:#010x}, carried {carried:#010x})")]
    CrcMismatch { computed: u32, carried: u32 },
    /// A continuity counter gap without the `discontinuity_indicator` set.
    #[error("continuity counter on {pid:?} jumped from {last} to {actual}")]
    DiscontinuityDetected { pid: Pid, last: u8, actual: u8 },
    /// The `section_length` field is larger than any section type allows.
    #[error("section_length {length} exceeds limit {limit}")]
    SectionTooLong { length: usize, limit: usize },
    /// The section is too short to hold the headers its syntax indicator promises.
    #[error("section of {length} bytes is too short")]
    TooShort { length: usize },
    /// `current_next_indicator` says this section only applies in the future.
    #[error("section is not yet applicable")]
    NotCurrent,
    /// The `pointer_field` points beyond the end of the packet payload.
    #[error("pointer_field {pointer} beyond end of {available} byte payload")]
    PointerOutOfRange { pointer: usize, available: usize },
}

/// The three bytes common to every section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionCommonHeader {
    pub table_id: u8,
    pub section_syntax_indicator: bool,
    pub private_indicator: bool,
    pub section_length: usize,
}

impl SectionCommonHeader {
    pub const SIZE: usize = 3;

    /// Panics if fewer than `SIZE` bytes are given.
    pub fn new(buf: &[u8]) -> SectionCommonHeader {
        assert!(buf.len() >= Self::SIZE);
        SectionCommonHeader {
            table_id: buf[0],
            section_syntax_indicator: buf[1] & 0b1000_0000 != 0,
            private_indicator: buf[1] & 0b0100_0000 != 0,
            section_length: ((u16::from(buf[1] & 0b0000_1111) << 8) | u16::from(buf[2])) as usize,
        }
    }

    /// Length of the whole section, including this header
    pub fn total_length(&self) -> usize {
        Self::SIZE + self.section_length
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CurrentNext {
    Current,
    Next,
}

impl CurrentNext {
    fn from(v: u8) -> CurrentNext {
        match v {
            0 => CurrentNext::Next,
            1 => CurrentNext::Current,
            _ => panic!("invalid current_next_indicator value {}", v),
        }
    }
}

/// Represents the fields that appear within long form sections, following the
/// `SectionCommonHeader`.
pub struct TableSyntaxHeader<'buf> {
    buf: &'buf [u8],
}

impl<'buf> TableSyntaxHeader<'buf> {
    pub const SIZE: usize = 5;

    /// Panics if fewer than `SIZE` bytes are given.
    pub fn new(buf: &'buf [u8]) -> TableSyntaxHeader<'buf> {
        assert!(buf.len() >= Self::SIZE);
        TableSyntaxHeader { buf }
    }
    /// The `table_id_extension`.  Guide tables use this for the service id (DVB EIT), the source
    /// id (ATSC EIT), the transport stream id (SDT, VCT) or the bouquet id (BAT).
    pub fn id(&self) -> u16 {
        u16::from(self.buf[0]) << 8 | u16::from(self.buf[1])
    }
    /// A 5-bit value that changes whenever the table content changes.
    pub fn version(&self) -> u8 {
        (self.buf[2] >> 1) & 0b0001_1111
    }
    pub fn current_next_indicator(&self) -> CurrentNext {
        CurrentNext::from(self.buf[2] & 1)
    }
    pub fn section_number(&self) -> u8 {
        self.buf[3]
    }
    pub fn last_section_number(&self) -> u8 {
        self.buf[4]
    }
}

impl<'buf> fmt::Debug for TableSyntaxHeader<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSyntaxHeader")
            .field("id", &self.id())
            .field("version", &self.version())
            .field("current_next_indicator", &self.current_next_indicator())
            .field("section_number", &self.section_number())
            .field("last_section_number", &self.last_section_number())
            .finish()
    }
}

/// Identity of a section for the purposes of deduplication.
///
/// `table_id_extension` is included so that, for example, EIT sections for different services
/// are not confused.  Short form sections have no version or section number, so for them the
/// `fingerprint` (a CRC computed over the whole section) stands in: identical repeats collapse,
/// distinct records do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionKey {
    pub pid: Pid,
    pub table_id: u8,
    pub table_id_extension: u16,
    pub section_number: u8,
    pub version: u8,
    pub fingerprint: u32,
}

/// A complete, validated section.
///
/// For long form sections `payload` excludes the 8 bytes of header and the 4 byte CRC, and `crc`
/// is the carried `CRC_32` value.  For short form sections `payload` is everything after the
/// 3-byte common header, and `crc` is computed locally.
#[derive(Clone, PartialEq, Eq)]
pub struct RawSection {
    pub pid: Pid,
    pub table_id: u8,
    pub table_id_extension: u16,
    pub section_number: u8,
    pub last_section_number: u8,
    pub version: u8,
    pub long_form: bool,
    pub payload: Vec<u8>,
    pub crc: u32,
}

impl RawSection {
    const LONG_HEADER_SIZE: usize = SectionCommonHeader::SIZE + TableSyntaxHeader::SIZE;
    const CRC_SIZE: usize = 4;

    /// Validate the complete section held in `data` (which must start with the table_id byte
    /// and be exactly as long as the `section_length` field says).
    pub fn parse(pid: Pid, data: &[u8]) -> Result<RawSection, SectionError> {
        if data.len() < SectionCommonHeader::SIZE {
            return Err(SectionError::TooShort { length: data.len() });
        }
        let header = SectionCommonHeader::new(data);
        if header.total_length() != data.len() {
            return Err(SectionError::TooShort { length: data.len() });
        }
        if !header.section_syntax_indicator {
            return Ok(RawSection {
                pid,
                table_id: header.table_id,
                table_id_extension: 0,
                section_number: 0,
                last_section_number: 0,
                version: 0,
                long_form: false,
                payload: data[SectionCommonHeader::SIZE..].to_vec(),
                crc: crc32(data),
            });
        }
        if data.len() < Self::LONG_HEADER_SIZE + Self::CRC_SIZE {
            return Err(SectionError::TooShort { length: data.len() });
        }
        let crc_start = data.len() - Self::CRC_SIZE;
        let computed = crc32(&data[..crc_start]);
        let carried = u32::from_be_bytes([
            data[crc_start],
            data[crc_start + 1],
            data[crc_start + 2],
            data[crc_start + 3],
        ]);
        // don't apply CRC checks when fuzzing, to give more chances of test data triggering
        // parser bugs,
        if !cfg!(fuzzing) && computed != carried {
            return Err(SectionError::CrcMismatch { computed, carried });
        }
        let tsh = TableSyntaxHeader::new(&data[SectionCommonHeader::SIZE..]);
        if tsh.current_next_indicator() == CurrentNext::Next {
            return Err(SectionError::NotCurrent);
        }
        Ok(RawSection {
            pid,
            table_id: header.table_id,
            table_id_extension: tsh.id(),
            section_number: tsh.section_number(),
            last_section_number: tsh.last_section_number(),
            version: tsh.version(),
            long_form: true,
            payload: data[Self::LONG_HEADER_SIZE..crc_start].to_vec(),
            crc: carried,
        })
    }

    /// Build a long form section around the given payload, computing its CRC.
    pub fn long(
        pid: Pid,
        table_id: u8,
        table_id_extension: u16,
        version: u8,
        section_number: u8,
        last_section_number: u8,
        payload: &[u8],
    ) -> RawSection {
        let mut section = RawSection {
            pid,
            table_id,
            table_id_extension,
            section_number,
            last_section_number,
            version: version & 0b1_1111,
            long_form: true,
            payload: payload.to_vec(),
            crc: 0,
        };
        let bytes = section.to_bytes();
        let crc_start = bytes.len() - Self::CRC_SIZE;
        section.crc = crc32(&bytes[..crc_start]);
        section
    }

    /// Build a short form section around the given payload.
    pub fn short(pid: Pid, table_id: u8, payload: &[u8]) -> RawSection {
        let mut section = RawSection {
            pid,
            table_id,
            table_id_extension: 0,
            section_number: 0,
            last_section_number: 0,
            version: 0,
            long_form: false,
            payload: payload.to_vec(),
            crc: 0,
        };
        section.crc = crc32(&section.to_bytes());
        section
    }

    /// Serialise back into section syntax, as it would appear in the transport stream.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + Self::LONG_HEADER_SIZE + 4);
        let section_length = if self.long_form {
            TableSyntaxHeader::SIZE + self.payload.len() + Self::CRC_SIZE
        } else {
            self.payload.len()
        };
        out.push(self.table_id);
        let syntax = if self.long_form { 0b1000_0000 } else { 0 };
        out.push(syntax | 0b0111_0000 | ((section_length >> 8) as u8 & 0b1111));
        out.push(section_length as u8);
        if self.long_form {
            out.extend_from_slice(&self.table_id_extension.to_be_bytes());
            out.push(0b1100_0000 | (self.version << 1) | 1);
            out.push(self.section_number);
            out.push(self.last_section_number);
            out.extend_from_slice(&self.payload);
            let crc = crc32(&out[..]);
            out.extend_from_slice(&crc.to_be_bytes());
        } else {
            out.extend_from_slice(&self.payload);
        }
        out
    }

    pub fn key(&self) -> SectionKey {
        SectionKey {
            pid: self.pid,
            table_id: self.table_id,
            table_id_extension: self.table_id_extension,
            section_number: self.section_number,
            version: self.version,
            fingerprint: if self.long_form { 0 } else { self.crc },
        }
    }
}

impl fmt::Debug for RawSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSection")
            .field("pid", &self.pid)
            .field("table_id", &format_args!("{:#04x}", self.table_id))
            .field("table_id_extension", &self.table_id_extension)
            .field("section_number", &self.section_number)
            .field("last_section_number", &self.last_section_number)
            .field("version", &self.version)
            .field("long_form", &self.long_form)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Split a serialised section into the payloads of consecutive transport stream packets for the
/// given PID, starting from continuity counter value `cc`.
#[cfg(test)]
pub(crate) fn packetise(pid: Pid, section: &[u8], cc: u8) -> Vec<Vec<u8>> {
    use crate::packet::Packet;
    let mut packets = vec![];
    let mut rest = section;
    let mut cc = cc;
    let mut first = true;
    while first || !rest.is_empty() {
        let mut buf = vec![0xffu8; Packet::SIZE];
        buf[0] = Packet::SYNC_BYTE;
        buf[1] = (u16::from(pid) >> 8) as u8 & 0b1_1111;
        if first {
            buf[1] |= 0b0100_0000;
        }
        buf[2] = u16::from(pid) as u8;
        buf[3] = 0b0001_0000 | (cc & 0b1111);
        let mut at = 4;
        if first {
            buf[at] = 0; // pointer_field
            at += 1;
        }
        let n = rest.len().min(Packet::SIZE - at);
        buf[at..at + n].copy_from_slice(&rest[..n]);
        rest = &rest[n..];
        packets.push(buf);
        cc = (cc + 1) & 0b1111;
        first = false;
    }
    packets
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use hex_literal::hex;

    #[test]
    fn crc_of_pat() {
        // a real PAT section, program 1 on PID 0x1000
        let sect = hex!("00b00d0001c100000001f0002ab104b2");
        assert_eq!(crc32(&sect[..]), 0);
        let raw = RawSection::parse(Pid::PAT, &sect[..]).unwrap();
        assert_eq!(raw.table_id_extension, 1);
        assert_eq!(raw.payload, hex!("0001f000").to_vec());
        assert_eq!(raw.crc, 0x2ab104b2);
    }

    #[test]
    fn crc_mismatch() {
        let mut sect = RawSection::long(Pid::EIT, 0x4e, 7, 3, 0, 1, b"abc").to_bytes();
        let last = sect.len() - 1;
        sect[last] ^= 0xff;
        assert_matches!(
            RawSection::parse(Pid::EIT, &sect[..]),
            Err(SectionError::CrcMismatch { .. })
        );
    }

    #[test]
    fn long_form_round_trip() {
        let raw = RawSection::long(Pid::EIT, 0x4e, 0x1234, 9, 2, 3, b"payload");
        let parsed = RawSection::parse(Pid::EIT, &raw.to_bytes()[..]).unwrap();
        assert_eq!(parsed, raw);
        assert_eq!(parsed.key().fingerprint, 0);
    }

    #[test]
    fn short_form_fingerprint() {
        let a = RawSection::short(Pid::new(0xd2), 0x90, b"one");
        let b = RawSection::short(Pid::new(0xd2), 0x90, b"two");
        assert_ne!(a.key(), b.key());
        let parsed = RawSection::parse(Pid::new(0xd2), &a.to_bytes()[..]).unwrap();
        assert_eq!(parsed.key(), a.key());
        assert!(!parsed.long_form);
    }

    #[test]
    fn next_section_rejected() {
        let mut sect = RawSection::long(Pid::EIT, 0x4e, 1, 0, 0, 0, b"").to_bytes();
        sect[5] &= 0b1111_1110;
        let len = sect.len();
        let crc = crc32(&sect[..len - 4]);
        sect[len - 4..].copy_from_slice(&crc.to_be_bytes());
        assert_matches!(
            RawSection::parse(Pid::EIT, &sect[..]),
            Err(SectionError::NotCurrent)
        );
    }

    #[test]
    fn too_short_for_syntax() {
        let sect = hex!("4e8003000000");
        assert_matches!(
            RawSection::parse(Pid::EIT, &sect[..]),
            Err(SectionError::TooShort { .. })
        );
    }
}
