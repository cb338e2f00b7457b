//! The per-PID reader threads, which turn packets from a `PacketSource` into sections and queue
//! them for the acquisition that started them.

use crate::buffer::{PacketSource, SectionBuffer, SourceError};
use crate::packet::{Packet, Pid};
use crate::psi::{RawSection, ReassemblyStats, SectionReassembler, TableFilter};
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Opens a packet source delivering a single PID.
pub trait SourceProvider {
    /// `None` if the PID can't be received.
    fn open(&self, pid: Pid) -> Option<Box<dyn PacketSource>>;
}

impl SourceProvider for SectionBuffer {
    fn open(&self, pid: Pid) -> Option<Box<dyn PacketSource>> {
        Some(Box::new(self.subscribe(&[pid])))
    }
}

/// Sections waiting to be decoded, shared between a reader thread and the acquisition polling
/// it.  When full, the oldest section is dropped to make room.
#[derive(Debug)]
pub struct SectionQueue {
    sections: Mutex<VecDeque<RawSection>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl SectionQueue {
    pub fn new(capacity: usize) -> SectionQueue {
        SectionQueue {
            sections: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RawSection>> {
        self.sections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, section: RawSection) {
        let mut sections = self.lock();
        if sections.len() >= self.capacity {
            sections.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        sections.push_back(section);
    }

    /// Take everything queued so far, in arrival order.
    pub fn drain(&self) -> VecDeque<RawSection> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sections discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Start a thread reading `pid` from `source`, reassembling sections that pass `filter` and
/// pushing them onto `queue` until `stop` is set or the source closes.  Joining the thread gives
/// the reassembler's statistics.
pub fn spawn_reader(
    mut source: Box<dyn PacketSource>,
    pid: Pid,
    filter: TableFilter,
    queue: Arc<SectionQueue>,
    stop: Arc<AtomicBool>,
    read_timeout: Duration,
) -> JoinHandle<ReassemblyStats> {
    thread::spawn(move || {
        let mut reassembler = SectionReassembler::new();
        reassembler.watch(pid, filter);
        source.change_pid_mapping(&[pid]);
        let mut buf = Vec::with_capacity(Packet::SIZE * 64);
        while !stop.load(Ordering::Acquire) {
            buf.clear();
            match source.read_packets(&mut buf, read_timeout) {
                Ok(0) => continue,
                Ok(count) => trace!("{:?}: {} packets", pid, count),
                Err(SourceError::Closed) => {
                    debug!("{:?}: source closed", pid);
                    break;
                }
            }
            for pk in buf.chunks_exact(Packet::SIZE).filter_map(Packet::try_new) {
                for section in reassembler.feed(&pk) {
                    queue.push(section);
                }
            }
        }
        reassembler.stats()
    })
}

/// A running reader and the queue it fills.
#[derive(Debug)]
pub(crate) struct ReaderHandle {
    pub(crate) pid: Pid,
    pub(crate) queue: Arc<SectionQueue>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<ReassemblyStats>>,
}

impl ReaderHandle {
    pub(crate) fn start(
        source: Box<dyn PacketSource>,
        pid: Pid,
        filter: TableFilter,
        capacity: usize,
        read_timeout: Duration,
    ) -> ReaderHandle {
        let queue = Arc::new(SectionQueue::new(capacity));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = spawn_reader(
            source,
            pid,
            filter,
            queue.clone(),
            stop.clone(),
            read_timeout,
        );
        ReaderHandle {
            pid,
            queue,
            stop,
            thread: Some(thread),
        }
    }

    /// Signal the thread to finish and wait for it.  `None` if it panicked.
    pub(crate) fn join(&mut self) -> Option<ReassemblyStats> {
        self.stop.store(true, Ordering::Release);
        match self.thread.take() {
            Some(thread) => thread.join().ok(),
            None => Some(ReassemblyStats::default()),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.join();
    }
}
