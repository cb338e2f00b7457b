//! Collection of tables from a live stream.
//!
//! Each table being collected is a [`TableAcquisition`](struct.TableAcquisition.html), which
//! starts a reader thread per PID and is then polled at a fixed interval.  Each poll decodes
//! whatever sections the readers have queued and merges the results into the `RecordStore`.
//! Most guide tables have no end marker, so an acquisition is considered to have converged once
//! the number of records it has collected stops changing for a number of consecutive polls.

pub mod protocol;
pub mod reader;

use crate::context::ProtocolContext;
use crate::decode::TableDecoder;
use crate::packet::Pid;
use crate::psi::{RawSection, ReassemblyStats};
use crate::record::RecordKind;
use crate::store::RecordStore;
use fixedbitset::FixedBitSet;
use log::{debug, info, warn};
use reader::{ReaderHandle, SourceProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timing and sizing of acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionConfig {
    /// Time between polls of the section queues.
    pub poll_interval: Duration,
    /// Number of consecutive polls without a change in record count after which a table is
    /// considered complete.
    pub repeats: u32,
    /// Sections each reader may queue before the oldest are dropped.
    pub queue_capacity: usize,
    /// How long a reader waits for packets before checking whether it should stop.
    pub read_timeout: Duration,
    /// Overall limit on the time spent acquiring.
    pub time_limit: Option<Duration>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig {
            poll_interval: Duration::from_secs(1),
            repeats: 5,
            queue_capacity: 4096,
            read_timeout: Duration::from_millis(50),
            time_limit: None,
        }
    }
}

impl AcquisitionConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_repeats(mut self, repeats: u32) -> Self {
        self.repeats = repeats;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = Some(time_limit);
        self
    }
}

/// Cooperative cancellation, shared between whoever wants acquisition to stop and the loop doing
/// the acquiring.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Conditions that stop a whole protocol run.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("no packet source available")]
    NoSource,
    #[error("reader thread for {0:?} panicked")]
    ReaderPanicked(Pid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    NotStarted,
    Collecting,
    Converged,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The `CancellationToken` was triggered.
    Requested,
    /// The configured time limit expired.
    Deadline,
}

/// How collection of one table ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    Converged { records: usize },
    /// No section was received at all.
    NoData,
    Cancelled(CancelReason),
}

/// Counters for one table's acquisition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub sections: u64,
    /// Sections the decoder could not make sense of.
    pub decode_failures: u64,
    /// Individual records that failed validation.
    pub rejected_records: u64,
    /// Sections the readers had to drop because the queue was full.
    pub queue_dropped: u64,
    pub reassembly: ReassemblyStats,
}

/// The collection of one table, from one or more PIDs.
pub struct TableAcquisition {
    pids: Vec<Pid>,
    decoder: Box<dyn TableDecoder>,
    state: AcquisitionState,
    outcome: Option<AcquisitionOutcome>,
    readers: Vec<ReaderHandle>,
    // sections seen, per (table_id, table_id_extension)
    completion: HashMap<(u8, u16), FixedBitSet>,
    last_count: Option<usize>,
    unchanged_polls: u32,
    repeats: u32,
    stats: TableStats,
}

impl TableAcquisition {
    pub fn new(pids: Vec<Pid>, decoder: Box<dyn TableDecoder>) -> TableAcquisition {
        TableAcquisition {
            pids,
            decoder,
            state: AcquisitionState::NotStarted,
            outcome: None,
            readers: vec![],
            completion: HashMap::new(),
            last_count: None,
            unchanged_polls: 0,
            repeats: AcquisitionConfig::default().repeats,
            stats: TableStats::default(),
        }
    }

    pub fn single<D: TableDecoder + 'static>(pid: Pid, decoder: D) -> TableAcquisition {
        TableAcquisition::new(vec![pid], Box::new(decoder))
    }

    pub fn name(&self) -> &'static str {
        self.decoder.name()
    }

    pub fn pids(&self) -> &[Pid] {
        &self.pids
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Set once the acquisition reaches a terminal state.
    pub fn outcome(&self) -> Option<AcquisitionOutcome> {
        self.outcome
    }

    pub fn stats(&self) -> TableStats {
        self.stats
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            AcquisitionState::Converged | AcquisitionState::Cancelled
        )
    }

    /// Start a reader on every PID, and forget any records of the kind this table produces.
    pub fn start(
        &mut self,
        provider: &dyn SourceProvider,
        store: &mut RecordStore,
        config: &AcquisitionConfig,
    ) -> Result<(), AcquisitionError> {
        self.stop()?;
        store.clear(self.decoder.counted_kind());
        self.completion.clear();
        self.last_count = None;
        self.unchanged_polls = 0;
        self.repeats = config.repeats;
        self.outcome = None;
        for pid in self.pids.clone() {
            let source = match provider.open(pid) {
                Some(source) => source,
                None => {
                    warn!("{}: can't receive {:?}", self.decoder.name(), pid);
                    self.stop()?;
                    return Err(AcquisitionError::NoSource);
                }
            };
            self.readers.push(ReaderHandle::start(
                source,
                pid,
                self.decoder.table_ids(),
                config.queue_capacity,
                config.read_timeout,
            ));
        }
        info!(
            "{}: collecting from {} PIDs",
            self.decoder.name(),
            self.pids.len()
        );
        self.state = AcquisitionState::Collecting;
        Ok(())
    }

    /// Drain and decode everything the readers have queued, then decide whether collection is
    /// complete.  Does nothing unless the acquisition is collecting.
    pub fn poll_once(
        &mut self,
        ctx: &mut ProtocolContext,
        store: &mut RecordStore,
        cancel: &CancellationToken,
    ) -> Result<AcquisitionState, AcquisitionError> {
        if self.state != AcquisitionState::Collecting {
            return Ok(self.state);
        }
        if cancel.is_cancelled() {
            self.cancel(CancelReason::Requested)?;
            return Ok(self.state);
        }
        let queued: Vec<_> = self.readers.iter().map(|r| r.queue.drain()).collect();
        for sections in queued {
            for section in sections {
                self.process(ctx, store, &section);
            }
        }
        let kind = self.decoder.counted_kind();
        let count = store.count(kind);
        if self.last_count == Some(count) {
            self.unchanged_polls += 1;
        } else {
            self.last_count = Some(count);
            self.unchanged_polls = 0;
        }
        if self.decoder.is_complete() || self.all_sections_seen() {
            debug!("{}: all sections received", self.decoder.name());
            self.converge(kind, count)?;
        } else if self.unchanged_polls >= self.repeats {
            self.converge(kind, count)?;
        }
        Ok(self.state)
    }

    fn process(&mut self, ctx: &mut ProtocolContext, store: &mut RecordStore, section: &RawSection) {
        self.stats.sections += 1;
        let tracks_completion = section.long_form && self.decoder.completes_on_last_section();
        if tracks_completion && section.section_number > section.last_section_number {
            warn!(
                "{}: {:?} table {:#04x} section {} beyond last_section_number {}",
                self.decoder.name(),
                section.pid,
                section.table_id,
                section.section_number,
                section.last_section_number
            );
            self.stats.decode_failures += 1;
            return;
        }
        match self.decoder.decode(ctx, section) {
            Ok(decoded) => {
                for e in &decoded.rejected {
                    debug!("{}: rejected record: {}", self.decoder.name(), e);
                }
                self.stats.rejected_records += decoded.rejected.len() as u64;
                store.merge_all(decoded.records);
                if tracks_completion {
                    let seen = self
                        .completion
                        .entry((section.table_id, section.table_id_extension))
                        .or_insert_with(|| {
                            FixedBitSet::with_capacity(usize::from(section.last_section_number) + 1)
                        });
                    seen.grow(usize::from(section.last_section_number) + 1);
                    seen.insert(usize::from(section.section_number));
                }
            }
            Err(e) => {
                warn!(
                    "{}: {:?} table {:#04x} section {}: {}",
                    self.decoder.name(),
                    section.pid,
                    section.table_id,
                    section.section_number,
                    e
                );
                self.stats.decode_failures += 1;
            }
        }
    }

    fn all_sections_seen(&self) -> bool {
        self.decoder.completes_on_last_section()
            && !self.completion.is_empty()
            && self
                .completion
                .values()
                .all(|seen| seen.count_ones(..) == seen.len())
    }

    fn converge(&mut self, kind: RecordKind, count: usize) -> Result<(), AcquisitionError> {
        self.state = AcquisitionState::Converged;
        let outcome = if self.stats.sections == 0 {
            info!("{}: no data", self.decoder.name());
            AcquisitionOutcome::NoData
        } else {
            info!("{}: converged with {} {}", self.decoder.name(), count, kind);
            AcquisitionOutcome::Converged { records: count }
        };
        self.outcome = Some(outcome);
        self.stop()
    }

    /// Abandon collection, stopping the readers.
    pub fn cancel(&mut self, reason: CancelReason) -> Result<(), AcquisitionError> {
        if self.is_finished() {
            return Ok(());
        }
        info!("{}: cancelled ({:?})", self.decoder.name(), reason);
        self.state = AcquisitionState::Cancelled;
        self.outcome = Some(AcquisitionOutcome::Cancelled(reason));
        self.stop()
    }

    /// Stop and join every reader, whatever state the acquisition is in.
    pub fn stop(&mut self) -> Result<(), AcquisitionError> {
        let mut panicked = None;
        for mut reader in self.readers.drain(..) {
            self.stats.queue_dropped += reader.queue.dropped();
            match reader.join() {
                Some(stats) => self.stats.reassembly += stats,
                None => {
                    warn!("reader for {:?} panicked", reader.pid);
                    panicked = Some(reader.pid);
                }
            }
        }
        match panicked {
            Some(pid) => Err(AcquisitionError::ReaderPanicked(pid)),
            None => Ok(()),
        }
    }

    /// True while any reader thread is still alive.
    pub fn readers_running(&self) -> bool {
        self.readers.iter().any(|r| r.is_running())
    }

    #[cfg(test)]
    fn inject(&self, section: RawSection) {
        self.readers[0].queue.push(section);
    }
}

impl Drop for TableAcquisition {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{}: {}", self.decoder.name(), e);
        }
    }
}

fn interruption(cancel: &CancellationToken, deadline: Option<Instant>) -> Option<CancelReason> {
    if cancel.is_cancelled() {
        Some(CancelReason::Requested)
    } else if deadline.map_or(false, |d| Instant::now() >= d) {
        Some(CancelReason::Deadline)
    } else {
        None
    }
}

/// Collect several tables at once, each converging independently, until all have finished or
/// acquisition is cancelled.  Returns each table's outcome, in order.
pub fn run_tables(
    tables: &mut [TableAcquisition],
    provider: &dyn SourceProvider,
    ctx: &mut ProtocolContext,
    store: &mut RecordStore,
    config: &AcquisitionConfig,
    cancel: &CancellationToken,
) -> Result<Vec<AcquisitionOutcome>, AcquisitionError> {
    let deadline = config.time_limit.map(|limit| Instant::now() + limit);
    for i in 0..tables.len() {
        if let Err(e) = tables[i].start(provider, store, config) {
            for started in &mut tables[..i] {
                started.stop()?;
            }
            return Err(e);
        }
    }
    loop {
        if let Some(reason) = interruption(cancel, deadline) {
            for t in tables.iter_mut() {
                t.cancel(reason)?;
            }
            break;
        }
        for t in tables.iter_mut() {
            t.poll_once(ctx, store, cancel)?;
        }
        if tables.iter().all(TableAcquisition::is_finished) {
            break;
        }
        if interruption(cancel, deadline).is_none() {
            std::thread::sleep(config.poll_interval);
        }
    }
    Ok(tables
        .iter()
        .map(|t| {
            t.outcome()
                .unwrap_or(AcquisitionOutcome::Cancelled(CancelReason::Requested))
        })
        .collect())
}
