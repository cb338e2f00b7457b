//! DVB service information, per _ETSI EN 300 468_: the PAT, NIT, SDT and EIT tables.

use super::text::decode_dvb_text;
use super::{
    bcd_hms, decode_until, dvb_time, expect_table, Cursor, Decode, DecodeError, Decoded,
    TableDecoder,
};
use crate::context::ProtocolContext;
use crate::descriptor::event::CridLocation;
use crate::descriptor::{handled, SiDescriptors};
use crate::packet::Pid;
use crate::psi::{RawSection, TableFilter};
use crate::record::{
    CategoryCode, ChannelRecord, ChannelType, LogicalChannelRecord, ProgramRecord, Record,
    RecordKind, SeasonMeta, ServiceEntry, ServiceIdentity, ServiceNameRecord, SummaryRecord,
    TitleRecord, TransportRecord,
};
use chrono::{DateTime, Utc};
use std::ops::Range;

pub const PAT_TABLE_ID: u8 = 0x00;
pub const NIT_ACTUAL_TABLE_ID: u8 = 0x40;
pub const NIT_OTHER_TABLE_ID: u8 = 0x41;
pub const SDT_ACTUAL_TABLE_ID: u8 = 0x42;
pub const SDT_OTHER_TABLE_ID: u8 = 0x46;
pub const EIT_PF_ACTUAL_TABLE_ID: u8 = 0x4e;
pub const EIT_SCHEDULE_OTHER_LAST_TABLE_ID: u8 = 0x6f;

#[derive(Debug)]
struct PatEntry {
    program_number: u16,
    pid: Pid,
}

impl Decode for PatEntry {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let program_number = c.u16("program_number")?;
        let pid = Pid::new(c.u16("program_map_PID")? & 0x1fff);
        Ok((
            PatEntry {
                program_number,
                pid,
            },
            c.position(),
        ))
    }
}

/// Program Association Table.
#[derive(Debug, Default)]
pub struct PatDecoder;

impl TableDecoder for PatDecoder {
    fn name(&self) -> &'static str {
        "pat"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[PAT_TABLE_ID])
    }

    fn decode(
        &mut self,
        _ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let (entries, _) = decode_until::<PatEntry>(payload, 0, payload.len())?;
        let mut out = Decoded::default();
        for e in entries {
            out.accept(Record::Program(ProgramRecord {
                transport_stream_id: section.table_id_extension,
                program_number: e.program_number,
                pid: e.pid,
            }));
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Program
    }

    fn completes_on_last_section(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct NitTransport {
    transport_stream_id: u16,
    original_network_id: u16,
    descriptors: Range<usize>,
}

impl Decode for NitTransport {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let transport_stream_id = c.u16("transport_stream_id")?;
        let original_network_id = c.u16("original_network_id")?;
        let len = c.len12("transport_descriptors_length")?;
        let start = c.position();
        c.skip("transport_descriptors", len)?;
        Ok((
            NitTransport {
                transport_stream_id,
                original_network_id,
                descriptors: start..start + len,
            },
            c.position(),
        ))
    }
}

/// Network Information Table: the transport streams of the network, their services and logical
/// channel numbers.
#[derive(Debug)]
pub struct NitDecoder {
    include_other: bool,
}

impl NitDecoder {
    /// Only the NIT of the network currently tuned.
    pub fn actual() -> NitDecoder {
        NitDecoder {
            include_other: false,
        }
    }

    /// The NITs of other networks as well.
    pub fn all() -> NitDecoder {
        NitDecoder {
            include_other: true,
        }
    }
}

impl TableDecoder for NitDecoder {
    fn name(&self) -> &'static str {
        "nit"
    }

    fn table_ids(&self) -> TableFilter {
        if self.include_other {
            TableFilter::only(&[NIT_ACTUAL_TABLE_ID, NIT_OTHER_TABLE_ID])
        } else {
            TableFilter::only(&[NIT_ACTUAL_TABLE_ID])
        }
    }

    fn decode(
        &mut self,
        _ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let mut c = Cursor::new(payload);
        let network_len = c.len12("network_descriptors_length")?;
        c.skip("network_descriptors", network_len)?;
        let loop_len = c.len12("transport_stream_loop_length")?;
        let start = c.position();
        let (transports, _) = decode_until::<NitTransport>(payload, start, start + loop_len)?;
        let mut out = Decoded::default();
        for ts in transports {
            let mut services = vec![];
            let mut lcns = vec![];
            for d in handled::<SiDescriptors<'_>>(&payload[ts.descriptors.clone()]) {
                match d {
                    Ok(SiDescriptors::ServiceList(list)) => {
                        services.extend(list.services().map(|(service_id, service_type)| {
                            ServiceEntry {
                                service_id,
                                service_type,
                            }
                        }))
                    }
                    Ok(SiDescriptors::LogicalChannel(l)) => lcns.extend(l.channels()),
                    Ok(_) => {}
                    Err(e) => out.reject(e),
                }
            }
            for lcn in lcns {
                out.accept(Record::LogicalChannel(LogicalChannelRecord {
                    service: ServiceIdentity {
                        original_network_id: ts.original_network_id,
                        transport_stream_id: ts.transport_stream_id,
                        service_id: lcn.service_id,
                    },
                    logical_channel_number: lcn.number,
                    visible: lcn.visible,
                }));
            }
            out.accept(Record::Transport(TransportRecord {
                network_id: section.table_id_extension,
                original_network_id: ts.original_network_id,
                transport_stream_id: ts.transport_stream_id,
                services,
            }));
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Transport
    }

    fn completes_on_last_section(&self) -> bool {
        !self.include_other
    }
}

#[derive(Debug)]
struct SdtService {
    service_id: u16,
    descriptors: Range<usize>,
}

impl Decode for SdtService {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let service_id = c.u16("service_id")?;
        c.skip("eit_flags", 1)?;
        let len = c.len12("descriptors_loop_length")?;
        let start = c.position();
        c.skip("service_descriptors", len)?;
        Ok((
            SdtService {
                service_id,
                descriptors: start..start + len,
            },
            c.position(),
        ))
    }
}

/// Service Description Table: the names of services.
#[derive(Debug)]
pub struct SdtDecoder {
    include_other: bool,
    names_only: bool,
}

impl SdtDecoder {
    pub fn actual() -> SdtDecoder {
        SdtDecoder {
            include_other: false,
            names_only: false,
        }
    }

    pub fn all() -> SdtDecoder {
        SdtDecoder {
            include_other: true,
            names_only: false,
        }
    }

    /// Produce `ServiceName` records instead of channels, for protocols (OpenTV) which list
    /// channels elsewhere and only need the SDT to name them.
    pub fn names_only(mut self) -> SdtDecoder {
        self.names_only = true;
        self
    }
}

impl TableDecoder for SdtDecoder {
    fn name(&self) -> &'static str {
        "sdt"
    }

    fn table_ids(&self) -> TableFilter {
        if self.include_other {
            TableFilter::only(&[SDT_ACTUAL_TABLE_ID, SDT_OTHER_TABLE_ID])
        } else {
            TableFilter::only(&[SDT_ACTUAL_TABLE_ID])
        }
    }

    fn decode(
        &mut self,
        _ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let mut c = Cursor::new(payload);
        let original_network_id = c.u16("original_network_id")?;
        c.skip("reserved_future_use", 1)?;
        let (services, _) = decode_until::<SdtService>(payload, c.position(), payload.len())?;
        let mut out = Decoded::default();
        for svc in services {
            let identity = ServiceIdentity {
                original_network_id,
                transport_stream_id: section.table_id_extension,
                service_id: svc.service_id,
            };
            let record = service_name(&payload[svc.descriptors.clone()]).map(
                |(name, service_type)| {
                    if self.names_only {
                        Record::ServiceName(ServiceNameRecord {
                            service: identity,
                            name,
                            channel_type: ChannelType::from_dvb(service_type),
                        })
                    } else {
                        Record::Channel(ChannelRecord {
                            channel_id: u32::from(svc.service_id),
                            original_network_id,
                            transport_stream_id: section.table_id_extension,
                            service_id: svc.service_id,
                            name,
                            channel_type: ChannelType::from_dvb(service_type),
                            user_channel_number: None,
                        })
                    }
                },
            );
            out.accept_result(record);
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        if self.names_only {
            RecordKind::ServiceName
        } else {
            RecordKind::Channel
        }
    }

    fn completes_on_last_section(&self) -> bool {
        !self.include_other
    }
}

fn service_name(descriptors: &[u8]) -> Result<(String, u8), DecodeError> {
    for d in handled::<SiDescriptors<'_>>(descriptors) {
        if let SiDescriptors::Service(s) = d? {
            let name = decode_dvb_text("service_name", s.service_name())?;
            return Ok((name, s.service_type()));
        }
    }
    Err(DecodeError::invalid(
        "service_name",
        "no service_descriptor",
    ))
}

/// One entry of an EIT event loop.  The same layout is used by Dish Network.
#[derive(Debug, Clone)]
pub(crate) struct EitEvent {
    pub event_id: u16,
    start_mjd: u16,
    start_bcd: u32,
    duration_bcd: u32,
    pub running_status: u8,
    pub descriptors: Range<usize>,
}

impl Decode for EitEvent {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let event_id = c.u16("event_id")?;
        let start_mjd = c.u16("start_time")?;
        let start_bcd = c.u24("start_time")?;
        let duration_bcd = c.u24("duration")?;
        let flags = c.u16("descriptors_loop_length")?;
        let len = usize::from(flags & 0x0fff);
        let start = c.position();
        c.skip("event_descriptors", len)?;
        Ok((
            EitEvent {
                event_id,
                start_mjd,
                start_bcd,
                duration_bcd,
                running_status: (flags >> 13) as u8,
                descriptors: start..start + len,
            },
            c.position(),
        ))
    }
}

impl EitEvent {
    pub fn start_time(&self) -> Result<DateTime<Utc>, DecodeError> {
        if self.start_mjd == 0xffff && self.start_bcd == 0xff_ffff {
            return Err(DecodeError::invalid("start_time", "undefined"));
        }
        dvb_time("start_time", self.start_mjd, self.start_bcd)
    }

    pub fn duration(&self) -> Result<chrono::Duration, DecodeError> {
        bcd_hms("duration", self.duration_bcd)
    }
}

/// transport_stream_id, original_network_id, segment_last_section_number, last_table_id
const EIT_HEADER_LEN: usize = 6;

pub(crate) fn eit_events(payload: &[u8]) -> Result<Vec<EitEvent>, DecodeError> {
    Cursor::new(payload).skip("eit_header", EIT_HEADER_LEN)?;
    decode_until::<EitEvent>(payload, EIT_HEADER_LEN, payload.len()).map(|(events, _)| events)
}

/// Event Information Table, present/following and schedule, actual and other.
#[derive(Debug)]
pub struct EitDecoder {
    table_ids: TableFilter,
}

impl EitDecoder {
    pub fn all() -> EitDecoder {
        EitDecoder {
            table_ids: TableFilter::range(EIT_PF_ACTUAL_TABLE_ID..=EIT_SCHEDULE_OTHER_LAST_TABLE_ID),
        }
    }

    /// Only the given table ids, which must be within `0x4e..=0x6f`.
    pub fn with_tables(table_ids: TableFilter) -> EitDecoder {
        EitDecoder { table_ids }
    }

    fn event(
        channel_id: u32,
        ev: &EitEvent,
        descriptors: &[u8],
    ) -> Result<(TitleRecord, Option<SummaryRecord>), DecodeError> {
        let start_time = ev.start_time()?;
        let duration = ev.duration()?;
        let mut name = None;
        let mut short_text = String::new();
        let mut extended = String::new();
        let mut category = None;
        let mut season: Option<SeasonMeta> = None;
        for d in handled::<SiDescriptors<'_>>(descriptors) {
            match d? {
                SiDescriptors::ShortEvent(se) if name.is_none() => {
                    name = Some(decode_dvb_text("event_name", se.event_name())?);
                    short_text = decode_dvb_text("text", se.text())?;
                }
                SiDescriptors::ExtendedEvent(ee) => {
                    extended.push_str(&decode_dvb_text("extended_text", ee.text())?);
                }
                SiDescriptors::Content(content) if category.is_none() => {
                    category = content
                        .nibbles()
                        .next()
                        .map(|(level1, level2)| CategoryCode::Pair(level1, level2));
                }
                SiDescriptors::ContentIdentifier(ci) => {
                    for crid in ci.crids() {
                        let crid = crid?;
                        if let CridLocation::Inline(bytes) = crid.location {
                            let meta = season.get_or_insert_with(SeasonMeta::default);
                            let value = String::from_utf8_lossy(bytes).into_owned();
                            if crid.is_series() {
                                meta.series_crid = Some(value);
                            } else if crid.is_episode() {
                                meta.episode_crid = Some(value);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        let event_name =
            name.ok_or_else(|| DecodeError::invalid("event_name", "no short_event_descriptor"))?;
        let summary = if short_text.is_empty() && extended.is_empty() {
            None
        } else {
            Some(SummaryRecord {
                event_id: u32::from(ev.event_id),
                short_description: short_text,
                extended_description: if extended.is_empty() {
                    None
                } else {
                    Some(extended)
                },
                flags: ev.running_status,
            })
        };
        Ok((
            TitleRecord {
                channel_id,
                category,
                event_id: u32::from(ev.event_id),
                event_name,
                start_time,
                duration,
                summary_available: summary.is_some(),
                season,
            },
            summary,
        ))
    }
}

impl TableDecoder for EitDecoder {
    fn name(&self) -> &'static str {
        "eit"
    }

    fn table_ids(&self) -> TableFilter {
        self.table_ids.clone()
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let channel_id = u32::from(section.table_id_extension);
        let mut out = Decoded::default();
        for ev in eit_events(payload)? {
            match EitDecoder::event(channel_id, &ev, &payload[ev.descriptors.clone()]) {
                Ok((title, summary)) => {
                    out.accept_title(ctx, title);
                    if let Some(summary) = summary {
                        out.accept(Record::Summary(summary));
                    }
                }
                Err(e) => out.reject(e),
            }
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Title
    }
}
