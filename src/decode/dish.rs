//! Dish Network's guide: EIT-structured tables in the user private range, with event names and
//! descriptions Huffman coded in one of two dictionaries.

use super::dvb::{eit_events, EitEvent};
use super::{expect_table, DecodeError, Decoded, TableDecoder};
use crate::context::ProtocolContext;
use crate::descriptor::dish::{DishDescriptors, DishDictionary, DishTextDescriptor};
use crate::descriptor::handled;
use crate::packet::Pid;
use crate::psi::{RawSection, TableFilter};
use crate::record::{CategoryCode, Record, RecordKind, SummaryRecord, TitleRecord};
use std::ops::RangeInclusive;

pub const EIT_PID: Pid = Pid::new(0x0300);
pub const EIT_TABLE_IDS: RangeInclusive<u8> = 0x80..=0xfe;

fn text(
    ctx: &ProtocolContext,
    field: &'static str,
    d: &DishTextDescriptor<'_>,
) -> Result<String, DecodeError> {
    let dict = match d.dictionary() {
        DishDictionary::Table128 => ctx.dish_dictionary_128.as_ref(),
        DishDictionary::Table255 => ctx.dish_dictionary_255.as_ref(),
    };
    let dict = dict.ok_or_else(|| {
        DecodeError::invalid("dictionary", format!("{:?} not loaded", d.dictionary()))
    })?;
    dict.decode(field, d.compressed(), Some(d.decompressed_len()))
}

#[derive(Debug)]
pub struct DishEitDecoder {
    table_ids: TableFilter,
}

impl Default for DishEitDecoder {
    fn default() -> Self {
        DishEitDecoder {
            table_ids: TableFilter::range(EIT_TABLE_IDS),
        }
    }
}

impl DishEitDecoder {
    fn event(
        ctx: &mut ProtocolContext,
        channel_id: u32,
        ev: &EitEvent,
        descriptors: &[u8],
    ) -> Result<(TitleRecord, Option<SummaryRecord>), DecodeError> {
        let start_time = ev.start_time()?;
        let duration = ev.duration()?;
        let mut name = None;
        let mut description = None;
        let mut category = None;
        for d in handled::<DishDescriptors<'_>>(descriptors) {
            match d? {
                DishDescriptors::Name(n) if name.is_none() => {
                    name = Some(text(ctx, "event_name", &n)?);
                }
                DishDescriptors::Description(desc) if description.is_none() => {
                    description = Some(text(ctx, "description", &desc)?);
                }
                DishDescriptors::Content(content) if category.is_none() => {
                    category = content
                        .nibbles()
                        .next()
                        .map(|(level1, level2)| CategoryCode::Pair(level1, level2));
                }
                _ => {}
            }
        }
        let event_name = ctx.fix_text(
            name.ok_or_else(|| DecodeError::invalid("event_name", "no name descriptor"))?,
        );
        let summary = description
            .filter(|d| !d.is_empty())
            .map(|d| SummaryRecord {
                event_id: u32::from(ev.event_id),
                short_description: d,
                extended_description: None,
                flags: ev.running_status,
            });
        Ok((
            TitleRecord {
                channel_id,
                category,
                event_id: u32::from(ev.event_id),
                event_name,
                start_time,
                duration,
                summary_available: summary.is_some(),
                season: None,
            },
            summary,
        ))
    }
}

impl TableDecoder for DishEitDecoder {
    fn name(&self) -> &'static str {
        "dish-eit"
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
        if ctx.dish_dictionary_128.is_none() && ctx.dish_dictionary_255.is_none() {
            return Err(DecodeError::invalid(
                "dictionary",
                "no Dish Network dictionaries loaded",
            ));
        }
        let payload = &section.payload[..];
        let channel_id = u32::from(section.table_id_extension);
        let mut out = Decoded::default();
        for ev in eit_events(payload)? {
            match DishEitDecoder::event(ctx, channel_id, &ev, &payload[ev.descriptors.clone()]) {
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
