//! MediaHighway 1 guide tables.  These are short form sections without CRC, carried on PIDs
//! `0xd2` (titles) and `0xd3` (channels, themes and summaries).

use super::text::decode_latin1;
use super::{decode_counted, expect_table, Cursor, Decode, DecodeError, Decoded, TableDecoder};
use crate::context::ProtocolContext;
use crate::packet::Pid;
use crate::psi::{RawSection, TableFilter};
use crate::record::{
    CategoryCode, CategoryRecord, ChannelRecord, ChannelType, Record, RecordKind, SummaryRecord,
    TitleRecord,
};
use chrono::{DateTime, Datelike, Utc};

pub const TITLE_PID: Pid = Pid::new(0xd2);
pub const GUIDE_PID: Pid = Pid::new(0xd3);

pub const TITLE_TABLE_ID: u8 = 0x90;
pub const SUMMARY_TABLE_ID: u8 = 0x90;
pub const CHANNEL_TABLE_ID: u8 = 0x91;
pub const THEME_TABLE_ID: u8 = 0x92;

/// `event_id` value meaning there is no summary.
const NO_SUMMARY: u32 = 0xffff_ffff;
/// `channel_id` value marking the end of the title carousel.
const END_MARKER: u8 = 0xff;

struct Mhw1Channel {
    original_network_id: u16,
    transport_stream_id: u16,
    service_id: u16,
    name: String,
}

impl Decode for Mhw1Channel {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let original_network_id = c.u16("original_network_id")?;
        let transport_stream_id = c.u16("transport_stream_id")?;
        let service_id = c.u16("service_id")?;
        let name = decode_latin1(c.bytes("channel_name", 16)?);
        Ok((
            Mhw1Channel {
                original_network_id,
                transport_stream_id,
                service_id,
                name,
            },
            c.position(),
        ))
    }
}

const CHANNEL_ENTRY_LEN: usize = 22;

#[derive(Debug, Default)]
pub struct Mhw1ChannelDecoder;

impl TableDecoder for Mhw1ChannelDecoder {
    fn name(&self) -> &'static str {
        "mhw1-channels"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[CHANNEL_TABLE_ID])
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        Cursor::new(payload).skip("reserved", 1)?;
        let count = (payload.len() - 1) / CHANNEL_ENTRY_LEN;
        let (channels, _) = decode_counted::<Mhw1Channel>(payload, 1, count)?;
        let mut out = Decoded::default();
        for (index, ch) in channels.into_iter().enumerate() {
            out.accept(Record::Channel(ChannelRecord {
                channel_id: index as u32 + 1,
                original_network_id: ch.original_network_id,
                transport_stream_id: ch.transport_stream_id,
                service_id: ch.service_id,
                name: ctx.fix_text(ch.name),
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

const THEME_GROUPS: usize = 16;
const THEME_NAME_LEN: usize = 15;

#[derive(Debug, Default)]
pub struct Mhw1ThemeDecoder;

impl TableDecoder for Mhw1ThemeDecoder {
    fn name(&self) -> &'static str {
        "mhw1-themes"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[THEME_TABLE_ID])
    }

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let mut c = Cursor::new(&section.payload);
        let starts = c.bytes("theme_group_starts", THEME_GROUPS)?;
        let names: Vec<String> = c
            .rest()
            .chunks_exact(THEME_NAME_LEN)
            .map(decode_latin1)
            .collect();
        let mut out = Decoded::default();
        for group in 0..THEME_GROUPS {
            let start = usize::from(starts[group]);
            let end = starts
                .get(group + 1)
                .map(|&s| usize::from(s))
                .unwrap_or(names.len())
                .min(names.len());
            for k in start..end {
                let index = k - start;
                if index > 0x0f {
                    out.reject(DecodeError::invalid(
                        "theme_index",
                        format!("group {} entry {} does not fit in 4 bits", group, index),
                    ));
                    continue;
                }
                let code = CategoryCode::Single(((group << 4) | index) as u16);
                let description = ctx.fix_text(names[k].clone());
                let record = CategoryRecord::new(code, description);
                if record.validate().is_ok() {
                    ctx.learn_category(code, &record.description);
                }
                out.accept(Record::Category(record));
            }
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Category
    }
}

const TITLE_LEN: usize = 23;

#[derive(Debug, Default)]
pub struct Mhw1TitleDecoder;

impl Mhw1TitleDecoder {
    /// Resolve a day-of-week and time to an absolute time in the week around `reference`.  Day 7
    /// also means Sunday.
    fn start_time(
        reference: DateTime<Utc>,
        day: u8,
        hours: u8,
        minutes: u8,
    ) -> Result<DateTime<Utc>, DecodeError> {
        if hours > 23 || minutes > 59 {
            return Err(DecodeError::invalid(
                "start_time",
                format!("{:02}:{:02}", hours, minutes),
            ));
        }
        let day = i64::from(day % 7);
        let back = i64::from(reference.weekday().num_days_from_sunday());
        let sunday = (reference.date_naive() - chrono::Duration::days(back))
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| DecodeError::invalid("start_time", "reference time out of range"))?
            .and_utc();
        let start = sunday
            + chrono::Duration::days(day)
            + chrono::Duration::hours(i64::from(hours))
            + chrono::Duration::minutes(i64::from(minutes));
        if start < reference - chrono::Duration::hours(84) {
            Ok(start + chrono::Duration::days(7))
        } else {
            Ok(start)
        }
    }
}

impl TableDecoder for Mhw1TitleDecoder {
    fn name(&self) -> &'static str {
        "mhw1-titles"
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
        let mut c = Cursor::new(&section.payload);
        let mut out = Decoded::default();
        let channel_id = c.u8("channel_id")?;
        if channel_id == END_MARKER {
            return Ok(out);
        }
        let theme = c.u8("theme_id")?;
        let day_hours = c.u8("day")?;
        let minutes_flags = c.u8("minutes")?;
        c.skip("reserved", 2)?;
        let duration = c.u16("duration")?;
        let title = decode_latin1(c.bytes("title", TITLE_LEN)?);
        c.skip("ppv_id", 4)?;
        let event_id = c.u32("event_id")?;
        c.skip("reserved", 4)?;

        let start_time = match Mhw1TitleDecoder::start_time(
            ctx.reference_time,
            day_hours >> 5,
            day_hours & 0b1_1111,
            minutes_flags >> 2,
        ) {
            Ok(t) => t,
            Err(e) => {
                out.reject(e);
                return Ok(out);
            }
        };
        let event_name = ctx.fix_text(title);
        out.accept_title(
            ctx,
            TitleRecord {
                channel_id: u32::from(channel_id),
                category: Some(CategoryCode::Single(u16::from(theme))),
                event_id,
                event_name,
                start_time,
                duration: chrono::Duration::minutes(i64::from(duration)),
                summary_available: minutes_flags & 1 != 0 && event_id != NO_SUMMARY,
                season: None,
            },
        );
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::Title
    }
}

const REPLAY_LEN: usize = 7;

#[derive(Debug, Default)]
pub struct Mhw1SummaryDecoder;

impl TableDecoder for Mhw1SummaryDecoder {
    fn name(&self) -> &'static str {
        "mhw1-summaries"
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
        let replays = c.u8("replay_count")?;
        c.skip("replays", usize::from(replays) * REPLAY_LEN)?;
        let text = ctx.fix_text(decode_latin1(c.rest()));
        let mut out = Decoded::default();
        out.accept(Record::Summary(SummaryRecord {
            event_id,
            short_description: text,
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
    use assert_matches::assert_matches;
    use bitstream_io::BitWrite;
    use chrono::TimeZone;

    fn padded(s: &str, len: usize) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.resize(len, b' ');
        v
    }

    #[test]
    fn channels() {
        let payload = make_test_data(|w| {
            w.write(8, 0)?;
            for (sid, name) in [(0x10, "Canal+"), (0x11, "Cine")] {
                w.write(16, 1)?;
                w.write(16, 2)?;
                w.write(16, sid)?;
                w.write_bytes(&padded(name, 16))?;
            }
            Ok(())
        });
        let raw = RawSection::short(GUIDE_PID, CHANNEL_TABLE_ID, &payload);
        let out = Mhw1ChannelDecoder
            .decode(&mut ProtocolContext::default(), &raw)
            .unwrap();
        assert_matches!(&out.records[..], [Record::Channel(a), Record::Channel(b)] => {
            assert_eq!(a.channel_id, 1);
            assert_eq!(a.name, "Canal+");
            assert_eq!(b.channel_id, 2);
            assert_eq!(b.service_id, 0x11);
        });
    }

    #[test]
    fn themes() {
        let mut payload = vec![0, 2, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3];
        for name in ["Movies", "Drama", "Sport"] {
            payload.extend(padded(name, THEME_NAME_LEN));
        }
        let raw = RawSection::short(GUIDE_PID, THEME_TABLE_ID, &payload);
        let mut ctx = ProtocolContext::default();
        let out = Mhw1ThemeDecoder.decode(&mut ctx, &raw).unwrap();
        let codes: Vec<_> = out
            .records
            .iter()
            .map(|r| match r {
                Record::Category(c) => (c.code, c.description.clone()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                (CategoryCode::Single(0x00), "Movies".to_string()),
                (CategoryCode::Single(0x01), "Drama".to_string()),
                (CategoryCode::Single(0x10), "Sport".to_string()),
            ]
        );
        assert_eq!(
            ctx.categorise(CategoryCode::Single(0x10), "Match").as_deref(),
            Some("Sport")
        );
    }

    #[test]
    fn theme_group_overflow() {
        // group 0 holds 17 names, the last of which would collide with group 1's codes
        let mut payload = vec![0, 17, 18, 18, 18, 18, 18, 18, 18, 18, 18, 18, 18, 18, 18, 18];
        for i in 0..18 {
            payload.extend(padded(&format!("Theme {}", i), THEME_NAME_LEN));
        }
        let raw = RawSection::short(GUIDE_PID, THEME_TABLE_ID, &payload);
        let mut ctx = ProtocolContext::default();
        let out = Mhw1ThemeDecoder.decode(&mut ctx, &raw).unwrap();
        assert_eq!(out.records.len(), 17);
        assert_matches!(
            &out.rejected[..],
            [DecodeError::InvalidField {
                field: "theme_index",
                ..
            }]
        );
        assert_eq!(
            ctx.categorise(CategoryCode::Single(0x10), "Match").as_deref(),
            Some("Theme 17")
        );
        assert_eq!(
            ctx.categorise(CategoryCode::Single(0x0f), "Film").as_deref(),
            Some("Theme 15")
        );
    }

    fn title_payload(channel_id: u8, day: u8, hours: u8, minutes: u8) -> Vec<u8> {
        make_test_data(|w| {
            w.write(8, channel_id)?;
            w.write(8, 0x10)?; // theme
            w.write(3, day)?;
            w.write(5, hours)?;
            w.write(6, minutes)?;
            w.write(1, 0)?;
            w.write(1, 1)?; // summary available
            w.write(16, 0)?;
            w.write(16, 95)?; // duration
            w.write_bytes(&padded("Ciudadano Kane", TITLE_LEN))?;
            w.write(32, 0u32)?;
            w.write(32, 0x0001_0203u32)?;
            w.write(32, 0u32)
        })
    }

    fn title(reference: DateTime<Utc>, day: u8, hours: u8, minutes: u8) -> TitleRecord {
        let raw = RawSection::short(TITLE_PID, TITLE_TABLE_ID, &title_payload(3, day, hours, minutes));
        let mut ctx = ProtocolContext::new(reference);
        let out = Mhw1TitleDecoder.decode(&mut ctx, &raw).unwrap();
        match &out.records[..] {
            [Record::Title(t)] => t.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn title_fields() {
        // a Wednesday
        let wed = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();
        let t = title(wed, 2, 20, 30);
        assert_eq!(t.channel_id, 3);
        assert_eq!(t.event_name, "Ciudadano Kane");
        assert_eq!(t.event_id, 0x0001_0203);
        assert_eq!(t.duration, chrono::Duration::minutes(95));
        assert!(t.summary_available);
        assert_eq!(t.start_time, Utc.with_ymd_and_hms(2024, 3, 5, 20, 30, 0).unwrap());
        // day 7 is Sunday
        let t = title(wed, 7, 10, 0);
        assert_eq!(t.start_time, Utc.with_ymd_and_hms(2024, 3, 3, 10, 0, 0).unwrap());
    }

    #[test]
    fn title_wraps_into_next_week() {
        // a Saturday: Monday of this week is more than 3.5 days ago, so means next Monday
        let sat = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let t = title(sat, 1, 8, 0);
        assert_eq!(t.start_time, Utc.with_ymd_and_hms(2024, 3, 11, 8, 0, 0).unwrap());
    }

    #[test]
    fn end_marker_and_bad_time() {
        let raw = RawSection::short(TITLE_PID, TITLE_TABLE_ID, &title_payload(0xff, 1, 1, 1));
        let out = Mhw1TitleDecoder
            .decode(&mut ProtocolContext::default(), &raw)
            .unwrap();
        assert!(out.is_empty());

        let raw = RawSection::short(TITLE_PID, TITLE_TABLE_ID, &title_payload(3, 1, 25, 1));
        let out = Mhw1TitleDecoder
            .decode(&mut ProtocolContext::default(), &raw)
            .unwrap();
        assert_matches!(
            &out.rejected[..],
            [DecodeError::InvalidField {
                field: "start_time",
                ..
            }]
        );
    }

    #[test]
    fn rejected_title_is_not_categorised() {
        let raw = RawSection::short(TITLE_PID, TITLE_TABLE_ID, &title_payload(0, 1, 1, 1));
        let mut ctx = ProtocolContext::default();
        let out = Mhw1TitleDecoder.decode(&mut ctx, &raw).unwrap();
        assert!(out.records.is_empty());
        assert_matches!(
            &out.rejected[..],
            [DecodeError::InvalidField {
                field: "channel_id",
                ..
            }]
        );
        assert_eq!(ctx.undefined_categories().count(), 0);

        let raw = RawSection::short(TITLE_PID, TITLE_TABLE_ID, &title_payload(3, 1, 1, 1));
        Mhw1TitleDecoder.decode(&mut ctx, &raw).unwrap();
        assert_eq!(ctx.undefined_categories().count(), 1);
    }

    #[test]
    fn summary_skips_replays() {
        let payload = make_test_data(|w| {
            w.write(32, 0x0001_0203u32)?;
            w.write(24, 0)?;
            w.write(8, 2)?; // replay_count
            w.write_bytes(&[0xaa; 2 * REPLAY_LEN])?;
            w.write_bytes(b"Un periodista investiga. jjj")
        });
        let raw = RawSection::short(GUIDE_PID, SUMMARY_TABLE_ID, &payload);
        let mut ctx = ProtocolContext::default().with_text_fixups(true);
        let out = Mhw1SummaryDecoder.decode(&mut ctx, &raw).unwrap();
        assert_matches!(&out.records[..], [Record::Summary(s)] => {
            assert_eq!(s.event_id, 0x0001_0203);
            assert_eq!(s.short_description, "Un periodista investiga. \u{a1}\u{a1}\u{a1}");
            assert_eq!(s.flags, 2);
        });
    }
}
