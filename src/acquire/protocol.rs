//! Per-protocol collection of a whole guide from one frequency.
//!
//! Every protocol collects its tables in stages: usually the channel list and category
//! definitions first, then titles and summaries together.  Later stages may depend on what
//! earlier ones found (ATSC event tables are located by the MGT, for example).

use super::reader::SourceProvider;
use super::{
    run_tables, AcquisitionConfig, AcquisitionError, AcquisitionOutcome, CancellationToken,
    TableAcquisition, TableStats,
};
use crate::context::ProtocolContext;
use crate::decode::atsc::{AtscEitDecoder, EttDecoder, MgtDecoder, VctDecoder};
use crate::decode::biop::CarouselDecoder;
use crate::decode::dish::{self, DishEitDecoder};
use crate::decode::dvb::{EitDecoder, NitDecoder, PatDecoder, SdtDecoder};
use crate::decode::opentv::{self, OpenTvChannelDecoder, OpenTvSummaryDecoder, OpenTvTitleDecoder};
use crate::decode::{mhw1, mhw2};
use crate::packet::Pid;
use crate::psi::ReassemblyStats;
use crate::record::CategoryRecord;
use crate::store::RecordStore;
use log::info;
use std::fmt;

/// The guide protocols which can be collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Dvb,
    Atsc,
    MediaHighway1,
    MediaHighway2,
    OpenTv,
    DishNetwork,
    ObjectCarousel { pid: Pid },
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Dvb => f.write_str("DVB"),
            Protocol::Atsc => f.write_str("ATSC PSIP"),
            Protocol::MediaHighway1 => f.write_str("MediaHighway 1"),
            Protocol::MediaHighway2 => f.write_str("MediaHighway 2"),
            Protocol::OpenTv => f.write_str("OpenTV"),
            Protocol::DishNetwork => f.write_str("Dish Network"),
            Protocol::ObjectCarousel { pid } => write!(f, "object carousel on {:?}", pid),
        }
    }
}

impl Protocol {
    /// A collector for this protocol, which will use the given context for every frequency it
    /// processes.
    pub fn collector(
        self,
        ctx: ProtocolContext,
        config: AcquisitionConfig,
    ) -> Box<dyn ProtocolCollector> {
        let state = CollectorState::new(ctx, config);
        match self {
            Protocol::Dvb => Box::new(DvbCollector(state)),
            Protocol::Atsc => Box::new(AtscCollector(state)),
            Protocol::MediaHighway1 => Box::new(Mhw1Collector(state)),
            Protocol::MediaHighway2 => Box::new(Mhw2Collector(state)),
            Protocol::OpenTv => Box::new(OpenTvCollector(state)),
            Protocol::DishNetwork => Box::new(DishCollector(state)),
            Protocol::ObjectCarousel { pid } => Box::new(CarouselCollector { pid, state }),
        }
    }
}

/// The result of acquiring one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub stage: usize,
    pub table: &'static str,
    pub outcome: AcquisitionOutcome,
    pub stats: TableStats,
}

/// Everything collected from one frequency.
#[derive(Debug)]
pub struct FrequencyGuide {
    pub protocol: Protocol,
    pub records: RecordStore,
    pub tables: Vec<TableReport>,
    pub reassembly: ReassemblyStats,
    /// Defined categories that were used, with their usage counts.
    pub category_usage: Vec<CategoryRecord>,
    /// Category codes seen in the broadcast which no definition covers.
    pub undefined_categories: Vec<CategoryRecord>,
}

impl FrequencyGuide {
    /// True when some table was cancelled rather than running to completion.
    pub fn cancelled(&self) -> bool {
        self.tables
            .iter()
            .any(|t| matches!(t.outcome, AcquisitionOutcome::Cancelled(_)))
    }
}

/// State shared by every collector implementation.
#[derive(Debug)]
pub struct CollectorState {
    pub ctx: ProtocolContext,
    pub config: AcquisitionConfig,
    pub store: RecordStore,
    cancel: CancellationToken,
    tables: Vec<TableReport>,
}

impl CollectorState {
    fn new(ctx: ProtocolContext, config: AcquisitionConfig) -> CollectorState {
        CollectorState {
            ctx,
            config,
            store: RecordStore::new(),
            cancel: CancellationToken::new(),
            tables: vec![],
        }
    }
}

/// Collects the guide of one protocol.
pub trait ProtocolCollector: Send {
    fn protocol(&self) -> Protocol;

    /// The tables of stage `index`, given what the earlier stages collected, or `None` once
    /// there are no more stages.
    fn stage(&self, index: usize, store: &RecordStore) -> Option<Vec<TableAcquisition>>;

    fn state(&self) -> &CollectorState;

    fn state_mut(&mut self) -> &mut CollectorState;

    /// A token which stops `process()` when cancelled, for use from another thread.
    fn cancellation(&self) -> CancellationToken {
        self.state().cancel.clone()
    }

    /// Run every stage against the current frequency.  Stops early if cancelled.
    fn process(&mut self, provider: &dyn SourceProvider) -> Result<(), AcquisitionError> {
        let protocol = self.protocol();
        for index in 0.. {
            let mut tables = match self.stage(index, &self.state().store) {
                Some(tables) => tables,
                None => break,
            };
            tables.retain(|t| !t.pids().is_empty());
            if tables.is_empty() {
                continue;
            }
            info!("{}: stage {}, {} tables", protocol, index, tables.len());
            let state = self.state_mut();
            let outcomes = run_tables(
                &mut tables,
                provider,
                &mut state.ctx,
                &mut state.store,
                &state.config,
                &state.cancel,
            )?;
            let mut cancelled = false;
            for (t, outcome) in tables.iter().zip(outcomes) {
                cancelled |= matches!(outcome, AcquisitionOutcome::Cancelled(_));
                state.tables.push(TableReport {
                    stage: index,
                    table: t.name(),
                    outcome,
                    stats: t.stats(),
                });
            }
            if cancelled {
                break;
            }
        }
        Ok(())
    }

    /// Ask a running `process()` to stop.
    fn stop(&self) {
        self.state().cancel.cancel();
    }

    /// Hand over everything collected from this frequency, leaving the collector ready for the
    /// next one.
    fn finish_frequency(&mut self) -> FrequencyGuide {
        let protocol = self.protocol();
        let state = self.state_mut();
        let tables = std::mem::take(&mut state.tables);
        let mut reassembly = ReassemblyStats::default();
        for t in &tables {
            reassembly += t.stats.reassembly;
        }
        let guide = FrequencyGuide {
            protocol,
            records: std::mem::take(&mut state.store),
            tables,
            reassembly,
            category_usage: state.ctx.category_usage(),
            undefined_categories: state.ctx.undefined_categories().cloned().collect(),
        };
        state.ctx.reset_usage();
        state.cancel = CancellationToken::new();
        guide
    }
}

fn pid_range(pids: std::ops::RangeInclusive<u16>) -> Vec<Pid> {
    pids.map(Pid::new).collect()
}

struct DvbCollector(CollectorState);

impl ProtocolCollector for DvbCollector {
    fn protocol(&self) -> Protocol {
        Protocol::Dvb
    }

    fn stage(&self, index: usize, _store: &RecordStore) -> Option<Vec<TableAcquisition>> {
        match index {
            0 => Some(vec![
                TableAcquisition::single(Pid::PAT, PatDecoder),
                TableAcquisition::single(Pid::NIT, NitDecoder::actual()),
                TableAcquisition::single(Pid::SDT_BAT, SdtDecoder::actual()),
            ]),
            1 => Some(vec![TableAcquisition::single(Pid::EIT, EitDecoder::all())]),
            _ => None,
        }
    }

    fn state(&self) -> &CollectorState {
        &self.0
    }

    fn state_mut(&mut self) -> &mut CollectorState {
        &mut self.0
    }
}

struct AtscCollector(CollectorState);

impl ProtocolCollector for AtscCollector {
    fn protocol(&self) -> Protocol {
        Protocol::Atsc
    }

    fn stage(&self, index: usize, store: &RecordStore) -> Option<Vec<TableAcquisition>> {
        match index {
            0 => Some(vec![
                TableAcquisition::single(Pid::PSIP, MgtDecoder),
                TableAcquisition::single(Pid::PSIP, VctDecoder),
            ]),
            1 => {
                let mut eit = vec![];
                let mut ett = vec![];
                for t in store.guide_tables() {
                    if t.eit_index().is_some() {
                        eit.push(t.pid);
                    } else if t.ett_index().is_some() {
                        ett.push(t.pid);
                    }
                }
                Some(vec![
                    TableAcquisition::new(eit, Box::new(AtscEitDecoder)),
                    TableAcquisition::new(ett, Box::new(EttDecoder)),
                ])
            }
            _ => None,
        }
    }

    fn state(&self) -> &CollectorState {
        &self.0
    }

    fn state_mut(&mut self) -> &mut CollectorState {
        &mut self.0
    }
}

struct Mhw1Collector(CollectorState);

impl ProtocolCollector for Mhw1Collector {
    fn protocol(&self) -> Protocol {
        Protocol::MediaHighway1
    }

    fn stage(&self, index: usize, _store: &RecordStore) -> Option<Vec<TableAcquisition>> {
        match index {
            0 => Some(vec![
                TableAcquisition::single(mhw1::GUIDE_PID, mhw1::Mhw1ChannelDecoder),
                TableAcquisition::single(mhw1::GUIDE_PID, mhw1::Mhw1ThemeDecoder),
            ]),
            1 => Some(vec![
                TableAcquisition::single(mhw1::TITLE_PID, mhw1::Mhw1TitleDecoder),
                TableAcquisition::single(mhw1::GUIDE_PID, mhw1::Mhw1SummaryDecoder),
            ]),
            _ => None,
        }
    }

    fn state(&self) -> &CollectorState {
        &self.0
    }

    fn state_mut(&mut self) -> &mut CollectorState {
        &mut self.0
    }
}

struct Mhw2Collector(CollectorState);

impl ProtocolCollector for Mhw2Collector {
    fn protocol(&self) -> Protocol {
        Protocol::MediaHighway2
    }

    fn stage(&self, index: usize, _store: &RecordStore) -> Option<Vec<TableAcquisition>> {
        match index {
            0 => Some(vec![
                TableAcquisition::single(mhw2::GUIDE_PID, mhw2::Mhw2ChannelDecoder),
                TableAcquisition::single(mhw2::GUIDE_PID, mhw2::Mhw2ThemeDecoder),
            ]),
            1 => Some(vec![
                TableAcquisition::single(mhw2::TITLE_PID, mhw2::Mhw2TitleDecoder),
                TableAcquisition::single(mhw2::SUMMARY_PID, mhw2::Mhw2SummaryDecoder),
            ]),
            _ => None,
        }
    }

    fn state(&self) -> &CollectorState {
        &self.0
    }

    fn state_mut(&mut self) -> &mut CollectorState {
        &mut self.0
    }
}

struct OpenTvCollector(CollectorState);

impl ProtocolCollector for OpenTvCollector {
    fn protocol(&self) -> Protocol {
        Protocol::OpenTv
    }

    fn stage(&self, index: usize, _store: &RecordStore) -> Option<Vec<TableAcquisition>> {
        match index {
            0 => Some(vec![
                TableAcquisition::single(opentv::CHANNEL_PID, OpenTvChannelDecoder),
                TableAcquisition::single(Pid::SDT_BAT, SdtDecoder::all().names_only()),
            ]),
            1 => Some(vec![
                TableAcquisition::new(
                    pid_range(opentv::TITLE_PIDS),
                    Box::new(OpenTvTitleDecoder),
                ),
                TableAcquisition::new(
                    pid_range(opentv::SUMMARY_PIDS),
                    Box::new(OpenTvSummaryDecoder),
                ),
            ]),
            _ => None,
        }
    }

    fn state(&self) -> &CollectorState {
        &self.0
    }

    fn state_mut(&mut self) -> &mut CollectorState {
        &mut self.0
    }
}

struct DishCollector(CollectorState);

impl ProtocolCollector for DishCollector {
    fn protocol(&self) -> Protocol {
        Protocol::DishNetwork
    }

    fn stage(&self, index: usize, _store: &RecordStore) -> Option<Vec<TableAcquisition>> {
        match index {
            0 => Some(vec![TableAcquisition::single(
                Pid::SDT_BAT,
                SdtDecoder::all(),
            )]),
            1 => Some(vec![TableAcquisition::single(
                dish::EIT_PID,
                DishEitDecoder::default(),
            )]),
            _ => None,
        }
    }

    fn state(&self) -> &CollectorState {
        &self.0
    }

    fn state_mut(&mut self) -> &mut CollectorState {
        &mut self.0
    }
}

struct CarouselCollector {
    pid: Pid,
    state: CollectorState,
}

impl ProtocolCollector for CarouselCollector {
    fn protocol(&self) -> Protocol {
        Protocol::ObjectCarousel { pid: self.pid }
    }

    fn stage(&self, index: usize, _store: &RecordStore) -> Option<Vec<TableAcquisition>> {
        match index {
            0 => Some(vec![TableAcquisition::single(
                self.pid,
                CarouselDecoder::new(),
            )]),
            _ => None,
        }
    }

    fn state(&self) -> &CollectorState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut CollectorState {
        &mut self.state
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acquire::CancelReason;
    use crate::buffer::SectionBuffer;
    use crate::packet::Packet;
    use crate::psi::{packetise, RawSection};
    use crate::record::RecordKind;
    use std::time::Duration;

    fn fast() -> AcquisitionConfig {
        AcquisitionConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_read_timeout(Duration::from_millis(5))
            .with_repeats(3)
    }

    #[test]
    fn mhw2_from_ring() {
        let ring = SectionBuffer::new(Packet::SIZE * 256);
        let mut collector = Protocol::MediaHighway2.collector(ProtocolContext::default(), fast());
        let mut payload = vec![0u8; 117];
        payload.push(1);
        payload.extend_from_slice(&[0, 1, 0, 2, 0, 3, 0, 0]);
        payload.push(4);
        payload.extend_from_slice(b"Test");
        let section =
            RawSection::short(mhw2::GUIDE_PID, mhw2::GUIDE_TABLE_ID, &payload).to_bytes();

        let feeder = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                // keep repeating the channel table, as a broadcast would, until the collector
                // has unsubscribed from it
                let mut cc = 0;
                for _ in 0..200 {
                    for pk in packetise(mhw2::GUIDE_PID, &section, cc) {
                        ring.push(&pk);
                        cc = (cc + 1) & 0xf;
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                ring.close();
            })
        };
        collector.process(&ring).unwrap();
        feeder.join().unwrap();

        let guide = collector.finish_frequency();
        assert_eq!(guide.protocol, Protocol::MediaHighway2);
        assert_eq!(guide.records.count(RecordKind::Channel), 1);
        let c = guide.records.channels().next().unwrap();
        assert_eq!(c.identity().service_id, 3);
        assert_eq!(c.original_network_id, 1);
        assert_eq!(c.transport_stream_id, 2);
        assert_eq!(c.name, "Test");
        assert_eq!(guide.tables.len(), 4);
        assert!(!guide.cancelled());
        assert!(guide.reassembly.sections >= 1);
    }

    #[test]
    fn stopped_before_processing() {
        let ring = SectionBuffer::new(Packet::SIZE * 16);
        let mut collector = Protocol::Dvb.collector(ProtocolContext::default(), fast());
        collector.stop();
        collector.process(&ring).unwrap();
        let guide = collector.finish_frequency();
        assert!(guide.cancelled());
        // stage 0 only
        assert_eq!(guide.tables.len(), 3);
        assert!(guide
            .tables
            .iter()
            .all(|t| t.outcome == AcquisitionOutcome::Cancelled(CancelReason::Requested)));
        // the next frequency starts afresh
        assert!(!collector.cancellation().is_cancelled());
    }

    #[test]
    fn atsc_event_tables_follow_mgt() {
        use crate::record::{GuideTableRecord, Record};
        let collector = Protocol::Atsc.collector(ProtocolContext::default(), fast());
        let mut store = RecordStore::new();
        let mgt = [
            (0x0100, 0x1d00),
            (0x0101, 0x1d01),
            (0x0200, 0x1e00),
            (0x0004, 0x1f00),
        ];
        for (table_type, pid) in mgt {
            store.merge(Record::GuideTable(GuideTableRecord {
                table_type,
                pid: Pid::new(pid),
                version: 0,
                number_bytes: 0,
            }));
        }
        let tables = collector.stage(1, &store).unwrap();
        assert_eq!(tables[0].pids(), &[Pid::new(0x1d00), Pid::new(0x1d01)]);
        assert_eq!(tables[1].pids(), &[Pid::new(0x1e00)]);
        assert!(collector.stage(2, &store).is_none());
    }
}
