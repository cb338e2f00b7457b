//! Accumulates the records decoded during acquisition of one frequency, merging repeats and
//! linking records that refer to one another.
//!
//! Broadcasts repeat everything, and correct themselves over time, so `merge()` is idempotent for
//! identical records and otherwise keeps the most recently arrived version.

use crate::record::{
    CarouselObjectRecord, CategoryCode, CategoryRecord, ChannelRecord, GuideTableRecord,
    LogicalChannelRecord, ProgramRecord, Record, RecordKind, ServiceIdentity, ServiceNameRecord,
    SummaryRecord, TitleRecord, TransportRecord,
};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};

/// What `RecordStore::merge()` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The record had an identity not seen before.
    Added,
    /// An identical record was already present.
    Unchanged,
    /// A record with the same identity was replaced or updated.
    Replaced,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub added: u64,
    pub unchanged: u64,
    pub replaced: u64,
    /// Replacements where the old and new records disagreed about what the identity refers to,
    /// such as two different events at the same time on the same channel.
    pub anomalies: u64,
}

type TitleKey = (u32, DateTime<Utc>);

#[derive(Debug)]
pub struct RecordStore {
    channels: Vec<ChannelRecord>,
    channel_index: HashMap<ServiceIdentity, usize>,
    next_user_number: u32,
    titles: BTreeMap<TitleKey, TitleRecord>,
    summaries: HashMap<u32, SummaryRecord>,
    categories: BTreeMap<CategoryCode, CategoryRecord>,
    programs: BTreeMap<(u16, u16), ProgramRecord>,
    transports: BTreeMap<(u16, u16), TransportRecord>,
    logical_channels: BTreeMap<ServiceIdentity, LogicalChannelRecord>,
    service_names: BTreeMap<ServiceIdentity, ServiceNameRecord>,
    guide_tables: BTreeMap<u16, GuideTableRecord>,
    carousel_objects: BTreeMap<(u16, Vec<u8>), CarouselObjectRecord>,
    stats: StoreStats,
}

impl Default for RecordStore {
    fn default() -> Self {
        RecordStore::new()
    }
}

impl RecordStore {
    pub fn new() -> RecordStore {
        RecordStore {
            channels: vec![],
            channel_index: HashMap::new(),
            next_user_number: 1,
            titles: BTreeMap::new(),
            summaries: HashMap::new(),
            categories: BTreeMap::new(),
            programs: BTreeMap::new(),
            transports: BTreeMap::new(),
            logical_channels: BTreeMap::new(),
            service_names: BTreeMap::new(),
            guide_tables: BTreeMap::new(),
            carousel_objects: BTreeMap::new(),
            stats: StoreStats::default(),
        }
    }

    pub fn merge(&mut self, record: Record) -> MergeOutcome {
        let outcome = match record {
            Record::Channel(c) => self.merge_channel(c),
            Record::Title(t) => self.merge_title(t),
            Record::Summary(s) => self.merge_summary(s),
            Record::Category(c) => replace(&mut self.categories, c.code, c),
            Record::Program(p) => {
                replace(&mut self.programs, (p.transport_stream_id, p.program_number), p)
            }
            Record::Transport(t) => replace(
                &mut self.transports,
                (t.original_network_id, t.transport_stream_id),
                t,
            ),
            Record::LogicalChannel(l) => self.merge_logical_channel(l),
            Record::ServiceName(n) => self.merge_service_name(n),
            Record::GuideTable(g) => replace(&mut self.guide_tables, g.table_type, g),
            Record::CarouselObject(o) => replace(
                &mut self.carousel_objects,
                (o.module_id, o.object_key.clone()),
                o,
            ),
        };
        match outcome {
            MergeOutcome::Added => self.stats.added += 1,
            MergeOutcome::Unchanged => self.stats.unchanged += 1,
            MergeOutcome::Replaced => self.stats.replaced += 1,
        }
        outcome
    }

    /// Merge every record, returning the number that were new.
    pub fn merge_all<I: IntoIterator<Item = Record>>(&mut self, records: I) -> usize {
        records
            .into_iter()
            .map(|r| self.merge(r))
            .filter(|&o| o == MergeOutcome::Added)
            .count()
    }

    fn merge_channel(&mut self, mut channel: ChannelRecord) -> MergeOutcome {
        let identity = channel.identity();
        if let Some(&index) = self.channel_index.get(&identity) {
            let existing = &mut self.channels[index];
            channel.channel_id = existing.channel_id;
            if channel.name.is_empty() {
                channel.name = existing.name.clone();
            }
            if channel.user_channel_number.is_none() {
                channel.user_channel_number = existing.user_channel_number;
            }
            if *existing == channel {
                return MergeOutcome::Unchanged;
            }
            debug!(
                "channel {} updated: {:?} -> {:?}",
                channel.channel_id, existing.name, channel.name
            );
            *existing = channel;
            return MergeOutcome::Replaced;
        }
        if let Some(lcn) = self.logical_channels.get(&identity) {
            channel.user_channel_number = Some(u32::from(lcn.logical_channel_number));
        }
        if let Some(n) = self.service_names.get(&identity) {
            apply_service_name(&mut channel, n);
        }
        match channel.user_channel_number {
            Some(n) => self.next_user_number = self.next_user_number.max(n.saturating_add(1)),
            None => {
                channel.user_channel_number = Some(self.next_user_number);
                self.next_user_number += 1;
            }
        }
        self.channel_index.insert(identity, self.channels.len());
        self.channels.push(channel);
        MergeOutcome::Added
    }

    fn merge_logical_channel(&mut self, lcn: LogicalChannelRecord) -> MergeOutcome {
        if let Some(&index) = self.channel_index.get(&lcn.service) {
            let number = u32::from(lcn.logical_channel_number);
            self.channels[index].user_channel_number = Some(number);
            self.next_user_number = self.next_user_number.max(number.saturating_add(1));
        }
        replace(&mut self.logical_channels, lcn.service, lcn)
    }

    fn merge_service_name(&mut self, name: ServiceNameRecord) -> MergeOutcome {
        if let Some(&index) = self.channel_index.get(&name.service) {
            apply_service_name(&mut self.channels[index], &name);
        }
        replace(&mut self.service_names, name.service, name)
    }

    fn merge_title(&mut self, title: TitleRecord) -> MergeOutcome {
        let key = (title.channel_id, title.start_time);
        match self.titles.get_mut(&key) {
            None => {
                self.titles.insert(key, title);
                MergeOutcome::Added
            }
            Some(existing) if *existing == title => MergeOutcome::Unchanged,
            Some(existing) => {
                if existing.event_id != title.event_id || existing.event_name != title.event_name {
                    warn!(
                        "channel {} at {}: event {} {:?} replaced by event {} {:?}",
                        title.channel_id,
                        title.start_time,
                        existing.event_id,
                        existing.event_name,
                        title.event_id,
                        title.event_name
                    );
                    self.stats.anomalies += 1;
                }
                *existing = title;
                MergeOutcome::Replaced
            }
        }
    }

    fn merge_summary(&mut self, summary: SummaryRecord) -> MergeOutcome {
        match self.summaries.get_mut(&summary.event_id) {
            None => {
                self.summaries.insert(summary.event_id, summary);
                MergeOutcome::Added
            }
            Some(existing) if *existing == summary => MergeOutcome::Unchanged,
            Some(existing) => {
                warn!(
                    "summary for event {} changed: {:?} -> {:?}",
                    summary.event_id, existing.short_description, summary.short_description
                );
                self.stats.anomalies += 1;
                *existing = summary;
                MergeOutcome::Replaced
            }
        }
    }

    /// The summary for a title's event.  Event ids are not unique across channels, so this is
    /// a lookup by event id alone.
    pub fn cross_reference(&self, title: &TitleRecord) -> Option<&SummaryRecord> {
        self.summaries.get(&title.event_id)
    }

    /// Every title, on any channel, which the summary describes.
    pub fn titles_for_summary(&self, summary: &SummaryRecord) -> Vec<&TitleRecord> {
        self.titles
            .values()
            .filter(|t| t.event_id == summary.event_id)
            .collect()
    }

    /// Channels in the order they were first seen.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelRecord> + '_ {
        self.channels.iter()
    }

    /// Find a channel by the protocol's own channel number.
    pub fn channel(&self, channel_id: u32) -> Option<&ChannelRecord> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }

    pub fn channel_by_identity(&self, identity: &ServiceIdentity) -> Option<&ChannelRecord> {
        self.channel_index.get(identity).map(|&i| &self.channels[i])
    }

    /// Titles ordered by channel and then start time.
    pub fn titles(&self) -> impl Iterator<Item = &TitleRecord> + '_ {
        self.titles.values()
    }

    pub fn summaries(&self) -> impl Iterator<Item = &SummaryRecord> + '_ {
        self.summaries.values()
    }

    pub fn summary(&self, event_id: u32) -> Option<&SummaryRecord> {
        self.summaries.get(&event_id)
    }

    pub fn categories(&self) -> impl Iterator<Item = &CategoryRecord> + '_ {
        self.categories.values()
    }

    pub fn programs(&self) -> impl Iterator<Item = &ProgramRecord> + '_ {
        self.programs.values()
    }

    pub fn transports(&self) -> impl Iterator<Item = &TransportRecord> + '_ {
        self.transports.values()
    }

    pub fn guide_tables(&self) -> impl Iterator<Item = &GuideTableRecord> + '_ {
        self.guide_tables.values()
    }

    pub fn carousel_objects(&self) -> impl Iterator<Item = &CarouselObjectRecord> + '_ {
        self.carousel_objects.values()
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        match kind {
            RecordKind::Channel => self.channels.len(),
            RecordKind::Title => self.titles.len(),
            RecordKind::Summary => self.summaries.len(),
            RecordKind::Category => self.categories.len(),
            RecordKind::Program => self.programs.len(),
            RecordKind::Transport => self.transports.len(),
            RecordKind::LogicalChannel => self.logical_channels.len(),
            RecordKind::ServiceName => self.service_names.len(),
            RecordKind::GuideTable => self.guide_tables.len(),
            RecordKind::CarouselObject => self.carousel_objects.len(),
        }
    }

    /// Forget all records of the given kind, as done when collection of a table restarts.
    pub fn clear(&mut self, kind: RecordKind) {
        match kind {
            RecordKind::Channel => {
                self.channels.clear();
                self.channel_index.clear();
                self.next_user_number = 1;
            }
            RecordKind::Title => self.titles.clear(),
            RecordKind::Summary => self.summaries.clear(),
            RecordKind::Category => self.categories.clear(),
            RecordKind::Program => self.programs.clear(),
            RecordKind::Transport => self.transports.clear(),
            RecordKind::LogicalChannel => self.logical_channels.clear(),
            RecordKind::ServiceName => self.service_names.clear(),
            RecordKind::GuideTable => self.guide_tables.clear(),
            RecordKind::CarouselObject => self.carousel_objects.clear(),
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }
}

fn apply_service_name(channel: &mut ChannelRecord, name: &ServiceNameRecord) {
    if !name.name.is_empty() {
        channel.name = name.name.clone();
    }
    channel.channel_type = name.channel_type;
}

fn replace<K: Ord, V: PartialEq>(map: &mut BTreeMap<K, V>, key: K, value: V) -> MergeOutcome {
    match map.get_mut(&key) {
        None => {
            map.insert(key, value);
            MergeOutcome::Added
        }
        Some(existing) if *existing == value => MergeOutcome::Unchanged,
        Some(existing) => {
            *existing = value;
            MergeOutcome::Replaced
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::ProtocolContext;
    use crate::decode::mhw2::{Mhw2ChannelDecoder, GUIDE_PID, GUIDE_TABLE_ID};
    use crate::decode::TableDecoder;
    use crate::psi::RawSection;
    use crate::record::ChannelType;
    use chrono::TimeZone;

    fn channel(sid: u16, name: &str, number: Option<u32>) -> ChannelRecord {
        ChannelRecord {
            channel_id: u32::from(sid),
            original_network_id: 1,
            transport_stream_id: 2,
            service_id: sid,
            name: name.to_string(),
            channel_type: ChannelType::Television,
            user_channel_number: number,
        }
    }

    fn title(channel_id: u32, event_id: u32, name: &str) -> TitleRecord {
        TitleRecord {
            channel_id,
            category: None,
            event_id,
            event_name: name.to_string(),
            start_time: Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap(),
            duration: chrono::Duration::minutes(60),
            summary_available: true,
            season: None,
        }
    }

    fn summary(event_id: u32, text: &str) -> SummaryRecord {
        SummaryRecord {
            event_id,
            short_description: text.to_string(),
            extended_description: None,
            flags: 0,
        }
    }

    #[test]
    fn repeated_section_merges_once() {
        let mut payload = vec![0u8; 117];
        payload.push(1);
        payload.extend_from_slice(&[0, 1, 0, 2, 0, 3, 0, 0]);
        payload.push(4);
        payload.extend_from_slice(b"Test");
        let raw = RawSection::short(GUIDE_PID, GUIDE_TABLE_ID, &payload);

        let mut store = RecordStore::new();
        let mut ctx = ProtocolContext::default();
        let mut decoder = Mhw2ChannelDecoder;
        for _ in 0..5 {
            let out = decoder.decode(&mut ctx, &raw).unwrap();
            store.merge_all(out.records);
        }
        assert_eq!(store.count(RecordKind::Channel), 1);
        let c = store.channels().next().unwrap();
        assert_eq!(c.original_network_id, 1);
        assert_eq!(c.transport_stream_id, 2);
        assert_eq!(c.service_id, 3);
        assert_eq!(c.name, "Test");
        assert_eq!(store.stats().added, 1);
        assert_eq!(store.stats().unchanged, 4);
    }

    #[test]
    fn channel_merge_keeps_first_id_and_present_fields() {
        let mut store = RecordStore::new();
        assert_eq!(
            store.merge(Record::Channel(channel(3, "Three", Some(103)))),
            MergeOutcome::Added
        );
        let mut again = channel(3, "", None);
        again.channel_id = 99;
        assert_eq!(store.merge(Record::Channel(again)), MergeOutcome::Unchanged);
        let c = store.channel(3).unwrap();
        assert_eq!(c.name, "Three");
        assert_eq!(c.user_channel_number, Some(103));
        assert!(store.channel(99).is_none());

        assert_eq!(
            store.merge(Record::Channel(channel(3, "Channel 3", None))),
            MergeOutcome::Replaced
        );
        assert_eq!(store.channel(3).unwrap().name, "Channel 3");
    }

    #[test]
    fn sequential_user_numbers() {
        let mut store = RecordStore::new();
        store.merge(Record::Channel(channel(1, "A", None)));
        store.merge(Record::Channel(channel(2, "B", Some(10))));
        store.merge(Record::Channel(channel(3, "C", None)));
        let numbers: Vec<_> = store.channels().map(|c| c.user_channel_number).collect();
        assert_eq!(numbers, vec![Some(1), Some(10), Some(11)]);
    }

    #[test]
    fn late_bound_names_and_numbers() {
        let mut store = RecordStore::new();
        let id = channel(5, "", None).identity();
        store.merge(Record::ServiceName(ServiceNameRecord {
            service: id,
            name: "Five".to_string(),
            channel_type: ChannelType::Radio,
        }));
        store.merge(Record::Channel(channel(5, "", None)));
        let c = store.channel_by_identity(&id).unwrap();
        assert_eq!(c.name, "Five");
        assert_eq!(c.channel_type, ChannelType::Radio);

        store.merge(Record::LogicalChannel(LogicalChannelRecord {
            service: id,
            logical_channel_number: 505,
            visible: true,
        }));
        assert_eq!(store.channel(5).unwrap().user_channel_number, Some(505));
        assert_eq!(store.count(RecordKind::LogicalChannel), 1);
    }

    #[test]
    fn title_conflict_newest_wins() {
        let mut store = RecordStore::new();
        assert_eq!(
            store.merge(Record::Title(title(1, 100, "News"))),
            MergeOutcome::Added
        );
        assert_eq!(
            store.merge(Record::Title(title(1, 100, "News"))),
            MergeOutcome::Unchanged
        );
        assert_eq!(
            store.merge(Record::Title(title(1, 101, "Film"))),
            MergeOutcome::Replaced
        );
        assert_eq!(store.count(RecordKind::Title), 1);
        assert_eq!(store.titles().next().unwrap().event_name, "Film");
        assert_eq!(store.stats().anomalies, 1);
        // a different channel at the same time is a different title
        store.merge(Record::Title(title(2, 101, "Film")));
        assert_eq!(store.count(RecordKind::Title), 2);
    }

    #[test]
    fn summary_joins_across_channels() {
        let mut store = RecordStore::new();
        store.merge(Record::Title(title(1, 4045, "Match")));
        store.merge(Record::Title(title(2, 4045, "Match")));
        store.merge(Record::Title(title(3, 17, "Other")));
        let s = summary(4045, "desc");
        store.merge(Record::Summary(s.clone()));

        let joined = store.titles_for_summary(&s);
        assert_eq!(joined.len(), 2);
        let mut channels: Vec<_> = joined.iter().map(|t| t.channel_id).collect();
        channels.sort();
        assert_eq!(channels, vec![1, 2]);
        for t in store.titles().filter(|t| t.event_id == 4045) {
            assert_eq!(store.cross_reference(t), Some(&s));
        }
        let other = store.titles().find(|t| t.event_id == 17).unwrap();
        assert_eq!(store.cross_reference(other), None);
    }

    #[test]
    fn clear_one_kind() {
        let mut store = RecordStore::new();
        store.merge(Record::Channel(channel(1, "A", None)));
        store.merge(Record::Summary(summary(1, "x")));
        store.clear(RecordKind::Channel);
        assert_eq!(store.count(RecordKind::Channel), 0);
        assert_eq!(store.count(RecordKind::Summary), 1);
        store.merge(Record::Channel(channel(2, "B", None)));
        assert_eq!(store.channel(2).unwrap().user_channel_number, Some(1));
    }
}
