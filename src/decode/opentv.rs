//! The OpenTV guide, as used by satellite platforms in the UK, Italy, Australia and New Zealand.
//!
//! Channels come from the bouquet association table, with names taken from the SDT (decoded in
//! names-only mode).  Titles and summaries have tables of their own, keyed by channel, whose text
//! is Huffman coded with a dictionary that must be supplied in the `ProtocolContext`.

use super::{
    decode_until, expect_table, mjd_to_date, Cursor, Decode, DecodeError, Decoded, TableDecoder,
};
use crate::context::ProtocolContext;
use crate::descriptor::handled;
use crate::descriptor::opentv::OpenTvDescriptors;
use crate::packet::Pid;
use crate::psi::{RawSection, TableFilter};
use crate::record::{
    CategoryCode, ChannelRecord, ChannelType, Record, RecordKind, SummaryRecord, TitleRecord,
};
use chrono::{DateTime, Utc};
use std::ops::{Range, RangeInclusive};

pub const BAT_TABLE_ID: u8 = 0x4a;
pub const TITLE_TABLE_IDS: RangeInclusive<u8> = 0xa0..=0xa3;
pub const SUMMARY_TABLE_IDS: RangeInclusive<u8> = 0xa8..=0xab;

pub const CHANNEL_PID: Pid = Pid::SDT_BAT;
pub const TITLE_PIDS: RangeInclusive<u16> = 0x30..=0x37;
pub const SUMMARY_PIDS: RangeInclusive<u16> = 0x40..=0x47;

struct BatTransport {
    transport_stream_id: u16,
    original_network_id: u16,
    descriptors: Range<usize>,
}

impl Decode for BatTransport {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let transport_stream_id = c.u16("transport_stream_id")?;
        let original_network_id = c.u16("original_network_id")?;
        let len = c.len12("transport_descriptors_length")?;
        let start = c.position();
        c.skip("transport_descriptors", len)?;
        Ok((
            BatTransport {
                transport_stream_id,
                original_network_id,
                descriptors: start..start + len,
            },
            c.position(),
        ))
    }
}

/// Channels, from the private channel list descriptors in the BAT.
#[derive(Debug, Default)]
pub struct OpenTvChannelDecoder;

impl TableDecoder for OpenTvChannelDecoder {
    fn name(&self) -> &'static str {
        "opentv-channels"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[BAT_TABLE_ID])
    }

    fn decode(
        &mut self,
        _ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let mut c = Cursor::new(payload);
        let bouquet_len = c.len12("bouquet_descriptors_length")?;
        c.skip("bouquet_descriptors", bouquet_len)?;
        let loop_len = c.len12("transport_stream_loop_length")?;
        let start = c.position();
        let (transports, _) = decode_until::<BatTransport>(payload, start, start + loop_len)?;
        let mut out = Decoded::default();
        for ts in transports {
            for d in handled::<OpenTvDescriptors<'_>>(&payload[ts.descriptors.clone()]) {
                let list = match d {
                    Ok(OpenTvDescriptors::ChannelList(list)) => list,
                    Ok(_) => continue,
                    Err(e) => {
                        out.reject(e);
                        break;
                    }
                };
                for ch in list.channels() {
                    out.accept(Record::Channel(ChannelRecord {
                        channel_id: u32::from(ch.channel_id),
                        original_network_id: ts.original_network_id,
                        transport_stream_id: ts.transport_stream_id,
                        service_id: ch.service_id,
                        name: String::new(),
                        channel_type: ChannelType::from_dvb(ch.channel_type),
                        user_channel_number: match ch.user_number {
                            0 | 0xffff => None,
                            n => Some(u32::from(n)),
                        },
                    }));
                }
            }
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Channel
    }
}

struct OpenTvEvent {
    event_id: u16,
    descriptors: Range<usize>,
}

impl Decode for OpenTvEvent {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let event_id = c.u16("event_id")?;
        let len = c.len12("event_length")?;
        let start = c.position();
        c.skip("event_descriptors", len)?;
        Ok((
            OpenTvEvent {
                event_id,
                descriptors: start..start + len,
            },
            c.position(),
        ))
    }
}

/// The base date, then the event loop.
fn events(payload: &[u8]) -> Result<(u16, Vec<OpenTvEvent>), DecodeError> {
    let mjd = Cursor::new(payload).u16("base_date")?;
    let (events, _) = decode_until::<OpenTvEvent>(payload, 2, payload.len())?;
    Ok((mjd, events))
}

fn require_dictionary(ctx: &ProtocolContext) -> Result<(), DecodeError> {
    if ctx.opentv_dictionary.is_none() {
        return Err(DecodeError::invalid(
            "dictionary",
            "no OpenTV Huffman dictionary loaded",
        ));
    }
    Ok(())
}

fn text(ctx: &ProtocolContext, field: &'static str, data: &[u8]) -> Result<String, DecodeError> {
    match ctx.opentv_dictionary {
        Some(ref dict) => dict.decode(field, data, None),
        None => Err(DecodeError::invalid(field, "no dictionary")),
    }
}

#[derive(Debug, Default)]
pub struct OpenTvTitleDecoder;

impl OpenTvTitleDecoder {
    fn event(
        ctx: &ProtocolContext,
        channel_id: u32,
        midnight: DateTime<Utc>,
        ev: &OpenTvEvent,
        descriptors: &[u8],
    ) -> Result<Option<TitleRecord>, DecodeError> {
        for d in handled::<OpenTvDescriptors<'_>>(descriptors) {
            if let OpenTvDescriptors::Title(t) = d? {
                return Ok(Some(TitleRecord {
                    channel_id,
                    category: Some(CategoryCode::Single(u16::from(t.theme()))),
                    event_id: u32::from(ev.event_id),
                    event_name: text(ctx, "title", t.title())?,
                    start_time: midnight + t.start_offset(),
                    duration: t.duration(),
                    summary_available: false,
                    season: None,
                }));
            }
        }
        Ok(None)
    }
}

impl TableDecoder for OpenTvTitleDecoder {
    fn name(&self) -> &'static str {
        "opentv-titles"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::range(TITLE_TABLE_IDS)
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        require_dictionary(ctx)?;
        let payload = &section.payload[..];
        let (mjd, events) = events(payload)?;
        let midnight = mjd_to_date(mjd)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| DecodeError::invalid("base_date", format!("bad MJD {}", mjd)))?
            .and_utc();
        let channel_id = u32::from(section.table_id_extension);
        let mut out = Decoded::default();
        for ev in events {
            let descriptors = &payload[ev.descriptors.clone()];
            match OpenTvTitleDecoder::event(ctx, channel_id, midnight, &ev, descriptors) {
                Ok(Some(title)) => out.accept_title(ctx, title),
                Ok(None) => {}
                Err(e) => out.reject(e),
            }
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Title
    }
}

#[derive(Debug, Default)]
pub struct OpenTvSummaryDecoder;

impl TableDecoder for OpenTvSummaryDecoder {
    fn name(&self) -> &'static str {
        "opentv-summaries"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::range(SUMMARY_TABLE_IDS)
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        require_dictionary(ctx)?;
        let payload = &section.payload[..];
        let (_, events) = events(payload)?;
        let mut out = Decoded::default();
        for ev in events {
            for d in handled::<OpenTvDescriptors<'_>>(&payload[ev.descriptors.clone()]) {
                let summary = d.and_then(|d| match d {
                    OpenTvDescriptors::Summary(s) => text(ctx, "summary", s.text()).map(Some),
                    _ => Ok(None),
                });
                match summary {
                    Ok(Some(summary)) => {
                        out.accept(Record::Summary(SummaryRecord {
                            event_id: u32::from(ev.event_id),
                            short_description: summary,
                            extended_description: None,
                            flags: 0,
                        }));
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        out.reject(e);
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Summary
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decode::huffman::HuffmanDictionary;
    use crate::decode::make_test_data;
    use assert_matches::assert_matches;
    use bitstream_io::BitWrite;
    use chrono::TimeZone;
    use hex_literal::*;

    const DICT: &str = "a=0
b=10
\\x20=110
STOP=1110
ESCAPE=1111
";

    fn ctx() -> ProtocolContext {
        ProtocolContext::default()
            .with_opentv_dictionary(HuffmanDictionary::parse(DICT.as_bytes()).unwrap())
    }

    #[test]
    fn bat_channels() {
        let payload = make_test_data(|w| {
            w.write(4, 0xf)?;
            w.write(12, 0)?; // bouquet_descriptors_length
            w.write(4, 0xf)?;
            w.write(12, 28)?;
            w.write(16, 0x0003)?; // transport_stream_id
            w.write(16, 0x0002)?; // original_network_id
            w.write(4, 0xf)?;
            w.write(12, 22)?;
            w.write_bytes(&hex!("b114 0003 1044 02 0101 0065 0000 1045 19 0102 0000 0001"))
        });
        let raw = RawSection::long(CHANNEL_PID, BAT_TABLE_ID, 0x1000, 0, 0, 0, &payload);
        let out = OpenTvChannelDecoder.decode(&mut ctx(), &raw).unwrap();
        assert_matches!(&out.records[..], [Record::Channel(a), Record::Channel(b)] => {
            assert_eq!(a.channel_id, 0x0101);
            assert_eq!(a.original_network_id, 2);
            assert_eq!(a.service_id, 0x1044);
            assert_eq!(a.channel_type, ChannelType::Radio);
            assert_eq!(a.user_channel_number, Some(101));
            assert!(a.name.is_empty());
            assert_eq!(b.user_channel_number, None);
        });
    }

    fn title_section(table_id: u8, descriptor: &[u8]) -> RawSection {
        let payload = make_test_data(|w| {
            w.write(16, 0xc079)?; // base date 1993-10-13
            w.write(16, 0x0042)?; // event_id
            w.write(4, 0xf)?;
            w.write(12, descriptor.len() as u32)?;
            w.write_bytes(descriptor)
        });
        RawSection::long(Pid::new(0x30), table_id, 0x0101, 0, 0, 0, &payload)
    }

    #[test]
    fn title() {
        let raw = title_section(0xa0, &hex!("b507 0708 0e10 04 00 5c"));
        let mut c = ctx();
        let out = OpenTvTitleDecoder.decode(&mut c, &raw).unwrap();
        assert_matches!(&out.records[..], [Record::Title(t)] => {
            assert_eq!(t.channel_id, 0x0101);
            assert_eq!(t.event_id, 0x42);
            assert_eq!(t.event_name, "ab");
            assert_eq!(t.start_time, Utc.with_ymd_and_hms(1993, 10, 13, 1, 0, 0).unwrap());
            assert_eq!(t.duration, chrono::Duration::hours(2));
            assert_eq!(t.category, Some(CategoryCode::Single(4)));
        });
        assert_eq!(c.undefined_categories().count(), 1);
    }

    #[test]
    fn summary() {
        // "b a", then STOP
        let raw = title_section(0xa8, &hex!("b902 b380"));
        let out = OpenTvSummaryDecoder.decode(&mut ctx(), &raw).unwrap();
        assert_matches!(&out.records[..], [Record::Summary(s)] => {
            assert_eq!(s.event_id, 0x42);
            assert_eq!(s.short_description, "b a");
        });
    }

    #[test]
    fn dictionary_required() {
        let raw = title_section(0xa0, &hex!("b507 0708 0e10 04 00 5c"));
        assert_matches!(
            OpenTvTitleDecoder.decode(&mut ProtocolContext::default(), &raw),
            Err(DecodeError::InvalidField {
                field: "dictionary",
                ..
            })
        );
    }

    #[test]
    fn short_title_descriptor_rejects_event() {
        let raw = title_section(0xa0, &hex!("b503 070800"));
        let out = OpenTvTitleDecoder.decode(&mut ctx(), &raw).unwrap();
        assert!(out.records.is_empty());
        assert_matches!(&out.rejected[..], [DecodeError::Truncated { .. }]);
    }
}
