//! MediaHighway 2 guide tables.  Short form sections without CRC; channels and themes share
//! table `0xc8` on PID `0x231` and are told apart by the first payload byte.

use super::text::decode_latin1;
use super::{
    decode_counted, dvb_time, expect_table, Cursor, Decode, DecodeError, Decoded, TableDecoder,
};
use crate::context::ProtocolContext;
use crate::packet::Pid;
use crate::psi::{RawSection, TableFilter};
use crate::record::{
    CategoryCode, CategoryRecord, ChannelRecord, ChannelType, Record, RecordKind, SummaryRecord,
    TitleRecord,
};

pub const GUIDE_PID: Pid = Pid::new(0x231);
pub const TITLE_PID: Pid = Pid::new(0x234);
pub const SUMMARY_PID: Pid = Pid::new(0x236);

pub const GUIDE_TABLE_ID: u8 = 0xc8;
pub const TITLE_TABLE_ID: u8 = 0xe6;
pub const SUMMARY_TABLE_ID: u8 = 0x96;

const CHANNEL_SECTION: u8 = 0x00;
const THEME_SECTION: u8 = 0x01;
const CHANNEL_COUNT_OFFSET: usize = 117;
const NO_SUMMARY: u32 = 0xffff_ffff;

/// A string prefixed by a length in the low 6 bits of its first byte.
fn short_string<'buf>(c: &mut Cursor<'buf>, field: &'static str) -> Result<&'buf [u8], DecodeError> {
    let len = usize::from(c.u8(field)? & 0b11_1111);
    c.bytes(field, len)
}

struct ChannelIds {
    original_network_id: u16,
    transport_stream_id: u16,
    service_id: u16,
}

impl Decode for ChannelIds {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let ids = ChannelIds {
            original_network_id: c.u16("original_network_id")?,
            transport_stream_id: c.u16("transport_stream_id")?,
            service_id: c.u16("service_id")?,
        };
        c.skip("reserved", 2)?;
        Ok((ids, c.position()))
    }
}

#[derive(Debug, Default)]
pub struct Mhw2ChannelDecoder;

impl TableDecoder for Mhw2ChannelDecoder {
    fn name(&self) -> &'static str {
        "mhw2-channels"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[GUIDE_TABLE_ID])
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let mut out = Decoded::default();
        if payload.first() != Some(&CHANNEL_SECTION) {
            return Ok(out);
        }
        let mut c = Cursor::at(payload, CHANNEL_COUNT_OFFSET);
        let count = usize::from(c.u8("channel_count")?);
        let (ids, next) = decode_counted::<ChannelIds>(payload, c.position(), count)?;
        let mut c = Cursor::at(payload, next);
        for (index, ids) in ids.into_iter().enumerate() {
            let name = decode_latin1(short_string(&mut c, "channel_name")?);
            out.accept(Record::Channel(ChannelRecord {
                channel_id: index as u32 + 1,
                original_network_id: ids.original_network_id,
                transport_stream_id: ids.transport_stream_id,
                service_id: ids.service_id,
                name: ctx.fix_text(name),
                channel_type: ChannelType::Television,
                user_channel_number: None,
            }));
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Channel
    }
}

#[derive(Debug, Default)]
pub struct Mhw2ThemeDecoder;

impl Mhw2ThemeDecoder {
    fn group(
        ctx: &mut ProtocolContext,
        out: &mut Decoded,
        payload: &[u8],
        group: u8,
        offset: usize,
    ) -> Result<(), DecodeError> {
        let mut c = Cursor::at(payload, offset);
        let sub_count = c.u8("sub_theme_count")? & 0b11_1111;
        let group_name = ctx.fix_text(decode_latin1(short_string(&mut c, "theme_name")?));
        for sub in 0..sub_count {
            let name = ctx.fix_text(decode_latin1(short_string(&mut c, "sub_theme_name")?));
            let description = if name.is_empty() {
                group_name.clone()
            } else {
                name
            };
            let code = CategoryCode::Pair(group, sub);
            let record = CategoryRecord::new(code, description);
            if record.validate().is_ok() {
                ctx.learn_category(code, &record.description);
            }
            out.accept(Record::Category(record));
        }
        Ok(())
    }
}

impl TableDecoder for Mhw2ThemeDecoder {
    fn name(&self) -> &'static str {
        "mhw2-themes"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[GUIDE_TABLE_ID])
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let mut out = Decoded::default();
        let mut c = Cursor::new(payload);
        if c.u8("section_type")? != THEME_SECTION {
            return Ok(out);
        }
        let groups = c.u8("theme_group_count")?;
        for group in 0..groups {
            let offset = usize::from(c.u16("theme_group_offset")?);
            // a bad group offset loses only that group
            if let Err(e) = Mhw2ThemeDecoder::group(ctx, &mut out, payload, group, offset) {
                out.reject(e);
            }
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Category
    }
}

struct Mhw2Title {
    channel_index: u8,
    start_mjd: u16,
    start_bcd: u32,
    duration_minutes: u16,
    title: String,
    theme: u8,
    sub_theme: u8,
    event_id: u32,
}

impl Decode for Mhw2Title {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let channel_index = c.u8("channel_id")?;
        c.skip("reserved", 2)?;
        let start_mjd = c.u16("start_date")?;
        let start_bcd = c.u24("start_time")?;
        let duration_minutes = c.u16("duration")? >> 4;
        let title = decode_latin1(short_string(&mut c, "title")?);
        let theme = c.u8("theme")? & 0b11_1111;
        let sub_theme = c.u8("sub_theme")?;
        c.skip("reserved", 1)?;
        let event_id = c.u32("event_id")?;
        Ok((
            Mhw2Title {
                channel_index,
                start_mjd,
                start_bcd,
                duration_minutes,
                title,
                theme,
                sub_theme,
                event_id,
            },
            c.position(),
        ))
    }
}

const TITLE_HEADER_LEN: usize = 15;

#[derive(Debug, Default)]
pub struct Mhw2TitleDecoder;

impl Mhw2TitleDecoder {
    fn title(ctx: &ProtocolContext, t: Mhw2Title) -> Result<TitleRecord, DecodeError> {
        let start_time = dvb_time("start_time", t.start_mjd, t.start_bcd)?;
        Ok(TitleRecord {
            // channel table indexes count from zero, channel ids from one
            channel_id: u32::from(t.channel_index) + 1,
            category: Some(CategoryCode::Pair(t.theme, t.sub_theme)),
            event_id: t.event_id,
            event_name: ctx.fix_text(t.title),
            start_time,
            duration: chrono::Duration::minutes(i64::from(t.duration_minutes)),
            summary_available: t.event_id != NO_SUMMARY,
            season: None,
        })
    }
}

impl TableDecoder for Mhw2TitleDecoder {
    fn name(&self) -> &'static str {
        "mhw2-titles"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[TITLE_TABLE_ID])
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        Cursor::new(payload).skip("header", TITLE_HEADER_LEN)?;
        let mut out = Decoded::default();
        let mut index = TITLE_HEADER_LEN;
        while index < payload.len() {
            let (title, next) = Mhw2Title::decode(payload, index)?;
            match Mhw2TitleDecoder::title(ctx, title) {
                Ok(title) => out.accept_title(ctx, title),
                Err(e) => out.reject(e),
            }
            index = next;
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Title
    }
}

const REPLAY_LEN: usize = 15;

#[derive(Debug, Default)]
pub struct Mhw2SummaryDecoder;

impl TableDecoder for Mhw2SummaryDecoder {
    fn name(&self) -> &'static str {
        "mhw2-summaries"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[SUMMARY_TABLE_ID])
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let mut c = Cursor::new(&section.payload);
        let event_id = c.u32("event_id")?;
        c.skip("reserved", 3)?;
        let replays = c.u8("replay_count")? & 0b11_1111;
        c.skip("replays", usize::from(replays) * REPLAY_LEN)?;
        let lines = c.u8("line_count")? & 0b1111;
        let mut text = Vec::with_capacity(usize::from(lines));
        for _ in 0..lines {
            let len = usize::from(c.u8("line_length")?);
            text.push(decode_latin1(c.bytes("line", len)?));
        }
        let mut out = Decoded::default();
        out.accept(Record::Summary(SummaryRecord {
            event_id,
            short_description: ctx.fix_text(text.join(" ")),
            extended_description: None,
            flags: replays,
        }));
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Summary
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decode::make_test_data;
    use crate::packet::Packet;
    use crate::psi::{packetise, SectionReassembler};
    use assert_matches::assert_matches;
    use bitstream_io::BitWrite;
    use chrono::{TimeZone, Utc};

    fn channel_payload(channels: &[(u16, u16, u16, &str)]) -> Vec<u8> {
        let mut payload = vec![0u8; CHANNEL_COUNT_OFFSET];
        payload[0] = CHANNEL_SECTION;
        payload.push(channels.len() as u8);
        for &(onid, tsid, sid, _) in channels {
            payload.extend_from_slice(&onid.to_be_bytes());
            payload.extend_from_slice(&tsid.to_be_bytes());
            payload.extend_from_slice(&sid.to_be_bytes());
            payload.extend_from_slice(&[0, 0]);
        }
        for &(_, _, _, name) in channels {
            payload.push(0b1100_0000 | name.len() as u8);
            payload.extend_from_slice(name.as_bytes());
        }
        payload
    }

    #[test]
    fn channels() {
        let payload = channel_payload(&[(1, 2, 3, "Test"), (1, 2, 4, "Otro")]);
        let raw = RawSection::short(GUIDE_PID, GUIDE_TABLE_ID, &payload);
        let mut ctx = ProtocolContext::default();
        let out = Mhw2ChannelDecoder.decode(&mut ctx, &raw).unwrap();
        assert_matches!(&out.records[..], [Record::Channel(a), Record::Channel(b)] => {
            assert_eq!(a.channel_id, 1);
            assert_eq!(a.name, "Test");
            assert_eq!(b.channel_id, 2);
            assert_eq!(b.service_id, 4);
        });
        // the same table id carries themes, which this decoder ignores
        let themes = RawSection::short(GUIDE_PID, GUIDE_TABLE_ID, &[THEME_SECTION, 0]);
        assert!(Mhw2ChannelDecoder.decode(&mut ctx, &themes).unwrap().is_empty());
    }

    #[test]
    fn repeated_channel_section_decodes_once() {
        let payload = channel_payload(&[(1, 2, 3, "Test")]);
        let section = RawSection::short(GUIDE_PID, GUIDE_TABLE_ID, &payload).to_bytes();
        let mut reassembler = SectionReassembler::new();
        reassembler.watch(GUIDE_PID, Mhw2ChannelDecoder.table_ids());
        let mut sections = vec![];
        for cc in 0..5 {
            for pk in packetise(GUIDE_PID, &section, cc) {
                sections.extend(reassembler.feed(&Packet::new(&pk[..])));
            }
        }
        assert_eq!(sections.len(), 1);
        assert_eq!(reassembler.stats().duplicates, 4);

        let mut ctx = ProtocolContext::default();
        let out = Mhw2ChannelDecoder.decode(&mut ctx, &sections[0]).unwrap();
        assert_matches!(&out.records[..], [Record::Channel(ch)] => {
            assert_eq!(ch.original_network_id, 1);
            assert_eq!(ch.transport_stream_id, 2);
            assert_eq!(ch.service_id, 3);
            assert_eq!(ch.name, "Test");
        });
    }

    #[test]
    fn themes() {
        // one group at offset 4: "Cine" with sub-themes "Drama" and ""
        let payload = make_test_data(|w| {
            w.write(8, THEME_SECTION)?;
            w.write(8, 1)?;
            w.write(16, 4)?;
            w.write(8, 2)?;
            w.write(8, 4)?;
            w.write_bytes(b"Cine")?;
            w.write(8, 5)?;
            w.write_bytes(b"Drama")?;
            w.write(8, 0)
        });
        let raw = RawSection::short(GUIDE_PID, GUIDE_TABLE_ID, &payload);
        let mut ctx = ProtocolContext::default();
        let out = Mhw2ThemeDecoder.decode(&mut ctx, &raw).unwrap();
        let got: Vec<_> = out
            .records
            .iter()
            .map(|r| match r {
                Record::Category(c) => (c.code, c.description.clone()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            got,
            vec![
                (CategoryCode::Pair(0, 0), "Drama".to_string()),
                (CategoryCode::Pair(0, 1), "Cine".to_string()),
            ]
        );
    }

    #[test]
    fn theme_group_offset_out_of_range() {
        let raw = RawSection::short(GUIDE_PID, GUIDE_TABLE_ID, &[THEME_SECTION, 1, 0, 0x40]);
        let out = Mhw2ThemeDecoder
            .decode(&mut ProtocolContext::default(), &raw)
            .unwrap();
        assert!(out.records.is_empty());
        assert_matches!(&out.rejected[..], [DecodeError::Truncated { .. }]);
    }

    fn title_record(
        w: &mut bitstream_io::BitWriter<Vec<u8>, bitstream_io::BE>,
        bcd: u32,
        event_id: u32,
    ) -> Result<(), std::io::Error> {
        w.write(8, 2)?; // channel index
        w.write(16, 0)?;
        w.write(16, 0xc079)?;
        w.write(24, bcd)?;
        w.write(12, 90)?;
        w.write(4, 0)?;
        w.write(8, 0b1100_0000 | 5)?;
        w.write_bytes(b"Title")?;
        w.write(8, 0b1100_0011)?;
        w.write(8, 1)?;
        w.write(8, 0)?;
        w.write(32, event_id)
    }

    #[test]
    fn titles() {
        let payload = make_test_data(|w| {
            w.write_bytes(&[0; TITLE_HEADER_LEN])?;
            title_record(w, 0x124500, 77)?;
            title_record(w, 0x12ff00, 78)?;
            title_record(w, 0x200000, NO_SUMMARY)
        });
        let raw = RawSection::short(TITLE_PID, TITLE_TABLE_ID, &payload);
        let mut ctx = ProtocolContext::default();
        let out = Mhw2TitleDecoder.decode(&mut ctx, &raw).unwrap();
        assert_eq!(out.rejected.len(), 1);
        assert_matches!(&out.records[..], [Record::Title(a), Record::Title(b)] => {
            assert_eq!(a.channel_id, 3);
            assert_eq!(a.event_name, "Title");
            assert_eq!(a.category, Some(CategoryCode::Pair(3, 1)));
            assert_eq!(a.start_time, Utc.with_ymd_and_hms(1993, 10, 13, 12, 45, 0).unwrap());
            assert_eq!(a.duration, chrono::Duration::minutes(90));
            assert!(a.summary_available);
            assert_eq!(b.event_id, NO_SUMMARY);
            assert!(!b.summary_available);
        });
    }

    #[test]
    fn summary_lines() {
        let payload = make_test_data(|w| {
            w.write(32, 77u32)?;
            w.write(24, 0)?;
            w.write(8, 0b1100_0001)?;
            w.write_bytes(&[0; REPLAY_LEN])?;
            w.write(8, 0b1111_0010)?;
            w.write(8, 3)?;
            w.write_bytes(b"One")?;
            w.write(8, 3)?;
            w.write_bytes(b"Two")
        });
        let raw = RawSection::short(SUMMARY_PID, SUMMARY_TABLE_ID, &payload);
        let out = Mhw2SummaryDecoder
            .decode(&mut ProtocolContext::default(), &raw)
            .unwrap();
        assert_matches!(&out.records[..], [Record::Summary(s)] => {
            assert_eq!(s.event_id, 77);
            assert_eq!(s.short_description, "One Two");
            assert_eq!(s.flags, 1);
        });
    }

    #[test]
    fn summary_truncated_line() {
        let raw = RawSection::short(SUMMARY_PID, SUMMARY_TABLE_ID, &[0, 0, 0, 1, 0, 0, 0, 0, 1, 9]);
        assert_matches!(
            Mhw2SummaryDecoder.decode(&mut ProtocolContext::default(), &raw),
            Err(DecodeError::Truncated { field: "line", .. })
        );
    }
}
