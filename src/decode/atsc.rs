//! ATSC Program and System Information Protocol, per _ATSC A/65_.
//!
//! All of the tables decoded here are carried on the base PID `0x1ffb`, apart from the EITs and
//! ETTs, whose PIDs are announced in the Master Guide Table.

use super::text::{decode_latin1, decode_utf16};
use super::{
    decode_counted, expect_table, gps_to_utc, Cursor, Decode, DecodeError, Decoded, TableDecoder,
};
use crate::context::ProtocolContext;
use crate::descriptor::{DescriptorIter, UnknownDescriptor};
use crate::packet::Pid;
use crate::psi::{RawSection, TableFilter};
use crate::record::{
    CategoryCode, ChannelRecord, ChannelType, GuideTableRecord, Record, RecordKind, SummaryRecord,
    TitleRecord,
};
use log::debug;

pub const MGT_TABLE_ID: u8 = 0xc7;
pub const TVCT_TABLE_ID: u8 = 0xc8;
pub const CVCT_TABLE_ID: u8 = 0xc9;
pub const EIT_TABLE_ID: u8 = 0xcb;
pub const ETT_TABLE_ID: u8 = 0xcc;
pub const STT_TABLE_ID: u8 = 0xcd;

const GENRE_DESCRIPTOR_TAG: u8 = 0xab;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    text: String,
}

impl Decode for Segment {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let compression_type = c.u8("compression_type")?;
        let mode = c.u8("mode")?;
        let len = usize::from(c.u8("number_bytes")?);
        let bytes = c.bytes("compressed_string_byte", len)?;
        if compression_type != 0 {
            return Err(DecodeError::invalid(
                "compression_type",
                format!("unsupported compression {:#04x}", compression_type),
            ));
        }
        let text = match mode {
            0x00 => decode_latin1(bytes),
            0x3f => decode_utf16(bytes),
            _ => {
                return Err(DecodeError::invalid(
                    "mode",
                    format!("unsupported mode {:#04x}", mode),
                ))
            }
        };
        Ok((Segment { text }, c.position()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LanguageString {
    language: [u8; 3],
    segments: Vec<Segment>,
}

impl Decode for LanguageString {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let lang = c.bytes("ISO_639_language_code", 3)?;
        let count = usize::from(c.u8("number_segments")?);
        let (segments, next) = decode_counted::<Segment>(buf, c.position(), count)?;
        Ok((
            LanguageString {
                language: [lang[0], lang[1], lang[2]],
                segments,
            },
            next,
        ))
    }
}

/// The `multiple_string_structure()`: the same text in one or more languages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipleString {
    strings: Vec<LanguageString>,
}

impl Decode for MultipleString {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let count = usize::from(Cursor::at(buf, index).u8("number_strings")?);
        let (strings, next) = decode_counted::<LanguageString>(buf, index + 1, count)?;
        Ok((MultipleString { strings }, next))
    }
}

impl MultipleString {
    /// The English text if there is any, otherwise whichever language came first.
    pub fn text(&self) -> String {
        let s = self
            .strings
            .iter()
            .find(|s| &s.language == b"eng")
            .or_else(|| self.strings.first());
        s.map(|s| s.segments.iter().map(|seg| seg.text.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Decode a multiple string structure that occupies exactly `bytes`.
fn multiple_string(bytes: &[u8]) -> Result<String, DecodeError> {
    if bytes.is_empty() {
        return Ok(String::new());
    }
    MultipleString::decode(bytes, 0).map(|(s, _)| s.text())
}

#[derive(Debug)]
struct MgtEntry {
    table_type: u16,
    pid: Pid,
    version: u8,
    number_bytes: u32,
}

impl Decode for MgtEntry {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let table_type = c.u16("table_type")?;
        let pid = Pid::new(c.u16("table_type_PID")? & 0x1fff);
        let version = c.u8("table_type_version_number")? & 0b1_1111;
        let number_bytes = c.u32("number_bytes")?;
        let len = c.len12("table_type_descriptors_length")?;
        c.skip("table_type_descriptors", len)?;
        Ok((
            MgtEntry {
                table_type,
                pid,
                version,
                number_bytes,
            },
            c.position(),
        ))
    }
}

/// Master Guide Table, plus the System Time Table which shares its PID and supplies the GPS to
/// UTC offset.
#[derive(Debug, Default)]
pub struct MgtDecoder;

impl MgtDecoder {
    fn system_time(ctx: &mut ProtocolContext, payload: &[u8]) -> Result<(), DecodeError> {
        let mut c = Cursor::new(payload);
        c.skip("protocol_version", 1)?;
        let system_time = c.u32("system_time")?;
        let offset = c.u8("GPS_UTC_offset")?;
        if ctx.gps_utc_offset != offset {
            debug!(
                "GPS_UTC_offset now {} (was {}), system time {:?}",
                offset,
                ctx.gps_utc_offset,
                gps_to_utc(system_time, offset)
            );
            ctx.gps_utc_offset = offset;
        }
        Ok(())
    }
}

impl TableDecoder for MgtDecoder {
    fn name(&self) -> &'static str {
        "mgt"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[MGT_TABLE_ID, STT_TABLE_ID])
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let mut out = Decoded::default();
        if section.table_id == STT_TABLE_ID {
            MgtDecoder::system_time(ctx, payload)?;
            return Ok(out);
        }
        let mut c = Cursor::new(payload);
        c.skip("protocol_version", 1)?;
        let count = usize::from(c.u16("tables_defined")?);
        let (entries, _) = decode_counted::<MgtEntry>(payload, c.position(), count)?;
        for e in entries {
            out.accept(Record::GuideTable(GuideTableRecord {
                table_type: e.table_type,
                pid: e.pid,
                version: e.version,
                number_bytes: e.number_bytes,
            }));
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::GuideTable
    }

    fn completes_on_last_section(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct VirtualChannel {
    short_name: String,
    major: u16,
    minor: u16,
    channel_tsid: u16,
    program_number: u16,
    service_type: u8,
    source_id: u16,
}

impl Decode for VirtualChannel {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let short_name = decode_utf16(c.bytes("short_name", 14)?);
        let numbers = c.u24("major_channel_number")?;
        c.skip("modulation_mode", 1)?;
        c.skip("carrier_frequency", 4)?;
        let channel_tsid = c.u16("channel_TSID")?;
        let program_number = c.u16("program_number")?;
        let flags = c.u16("service_type")?;
        let source_id = c.u16("source_id")?;
        let len = usize::from(c.u16("descriptors_length")? & 0x03ff);
        c.skip("descriptors", len)?;
        Ok((
            VirtualChannel {
                short_name,
                major: ((numbers >> 10) & 0x3ff) as u16,
                minor: (numbers & 0x3ff) as u16,
                channel_tsid,
                program_number,
                service_type: (flags & 0b11_1111) as u8,
                source_id,
            },
            c.position(),
        ))
    }
}

/// Terrestrial and cable Virtual Channel Tables.
#[derive(Debug, Default)]
pub struct VctDecoder;

impl TableDecoder for VctDecoder {
    fn name(&self) -> &'static str {
        "vct"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[TVCT_TABLE_ID, CVCT_TABLE_ID])
    }

    fn decode(
        &mut self,
        _ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let mut c = Cursor::new(payload);
        c.skip("protocol_version", 1)?;
        let count = usize::from(c.u8("num_channels_in_section")?);
        let (channels, _) = decode_counted::<VirtualChannel>(payload, c.position(), count)?;
        let mut out = Decoded::default();
        for ch in channels {
            out.accept(Record::Channel(ChannelRecord {
                channel_id: u32::from(ch.source_id),
                original_network_id: 0,
                transport_stream_id: ch.channel_tsid,
                service_id: ch.program_number,
                name: ch.short_name,
                channel_type: ChannelType::from_atsc(ch.service_type),
                user_channel_number: Some(u32::from(ch.major) * 1000 + u32::from(ch.minor)),
            }));
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Channel
    }

    fn completes_on_last_section(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct AtscEvent {
    event_id: u16,
    start_time: u32,
    etm_location: u8,
    length_seconds: u32,
    title: String,
    genre: Option<u8>,
}

impl Decode for AtscEvent {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let event_id = c.u16("event_id")? & 0x3fff;
        let start_time = c.u32("start_time")?;
        let timing = c.u24("length_in_seconds")?;
        let title_len = usize::from(c.u8("title_length")?);
        let title = multiple_string(c.bytes("title_text", title_len)?)?;
        let desc_len = c.len12("descriptors_length")?;
        let descriptors = c.bytes("descriptors", desc_len)?;
        let genre = DescriptorIter::<UnknownDescriptor<'_>>::new(descriptors)
            .filter_map(Result::ok)
            .find(|d| d.tag == GENRE_DESCRIPTOR_TAG)
            .and_then(|d| {
                // reserved(3) attribute_count(5), then the attributes
                let count = d.payload.first().map(|b| b & 0x1f).unwrap_or(0);
                if count > 0 {
                    d.payload.get(1).copied()
                } else {
                    None
                }
            });
        Ok((
            AtscEvent {
                event_id,
                start_time,
                etm_location: ((timing >> 20) & 0b11) as u8,
                length_seconds: timing & 0x0f_ffff,
                title,
                genre,
            },
            c.position(),
        ))
    }
}

/// ATSC Event Information Tables (EIT-0 to EIT-127).
#[derive(Debug, Default)]
pub struct AtscEitDecoder;

impl TableDecoder for AtscEitDecoder {
    fn name(&self) -> &'static str {
        "atsc-eit"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[EIT_TABLE_ID])
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let mut c = Cursor::new(payload);
        c.skip("protocol_version", 1)?;
        let count = usize::from(c.u8("num_events_in_section")?);
        let (events, _) = decode_counted::<AtscEvent>(payload, c.position(), count)?;
        let mut out = Decoded::default();
        for ev in events {
            let start_time = match gps_to_utc(ev.start_time, ctx.gps_utc_offset) {
                Some(t) => t,
                None => {
                    out.reject(DecodeError::invalid("start_time", "out of range"));
                    continue;
                }
            };
            let category = ev.genre.map(|g| CategoryCode::Single(u16::from(g)));
            out.accept_title(
                ctx,
                TitleRecord {
                    channel_id: u32::from(section.table_id_extension),
                    category,
                    event_id: u32::from(ev.event_id),
                    event_name: ev.title,
                    start_time,
                    duration: chrono::Duration::seconds(i64::from(ev.length_seconds)),
                    summary_available: ev.etm_location != 0,
                    season: None,
                },
            );
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Title
    }
}

/// Extended Text Tables, which carry event descriptions.  Channel ETMs are ignored.
#[derive(Debug, Default)]
pub struct EttDecoder;

impl TableDecoder for EttDecoder {
    fn name(&self) -> &'static str {
        "ett"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[ETT_TABLE_ID])
    }

    fn decode(
        &mut self,
        _ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let mut c = Cursor::new(payload);
        c.skip("protocol_version", 1)?;
        let etm_id = c.u32("ETM_id")?;
        let mut out = Decoded::default();
        if etm_id & 0b11 != 0b10 {
            return Ok(out);
        }
        let (text, _) = MultipleString::decode(payload, c.position())?;
        out.accept(Record::Summary(SummaryRecord {
            event_id: (etm_id >> 2) & 0x3fff,
            short_description: text.text(),
            extended_description: None,
            flags: 0,
        }));
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Summary
    }
}
