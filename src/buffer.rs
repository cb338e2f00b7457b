//! A fixed-size ring of transport stream bytes, filled by whatever is receiving the broadcast,
//! and drained by any number of PID-filtered readers.
//!
//! The producer side knows nothing about packet boundaries; it just `push()`es whatever bytes the
//! tuner delivered.  Each [`BufferReader`](struct.BufferReader.html) keeps its own cursor into the
//! ring, resynchronises on the `0x47` sync byte, and hands back only the whole packets whose PID it
//! subscribed to.  A reader that falls more than one ring-length behind loses the overwritten bytes,
//! which is reported in [`BufferStats`](struct.BufferStats.html).

use crate::packet::{Packet, Pid};
use fixedbitset::FixedBitSet;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Problems a `PacketSource` can report to its reader.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The producer has called `close()` and every byte written before that has been consumed.
    #[error("packet source closed")]
    Closed,
}

/// Something which can hand out whole transport stream packets for a fixed set of PIDs.
pub trait PacketSource: Send {
    /// Append whole 188-byte packets to `out`, waiting at most `timeout` for data to arrive.
    /// Returns the number of packets appended, which is zero if the timeout expired.
    fn read_packets(&mut self, out: &mut Vec<u8>, timeout: Duration) -> Result<usize, SourceError>;

    /// Replace the set of PIDs this source delivers.
    fn change_pid_mapping(&mut self, pids: &[Pid]);
}

/// Snapshot of a `SectionBuffer`'s usage, for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    /// Size of the ring in bytes.
    pub capacity: usize,
    /// Bytes written but not yet consumed by the slowest subscriber.
    pub used: usize,
    /// Total bytes ever pushed.
    pub written: u64,
    /// Bytes overwritten before some subscriber had read them.
    pub overflowed: u64,
    /// Number of currently attached readers.
    pub subscribers: usize,
}

struct Subscription {
    pids: FixedBitSet,
    cursor: u64,
}

struct RingState {
    data: Vec<u8>,
    written: u64,
    overflowed: u64,
    closed: bool,
    next_id: u64,
    subscriptions: HashMap<u64, Subscription>,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn oldest(&self) -> u64 {
        self.written.saturating_sub(self.capacity() as u64)
    }

    fn write(&mut self, buf: &[u8]) {
        let cap = self.capacity();
        // only the tail can survive if the producer hands us more than a ring's worth
        let (skip, buf) = if buf.len() > cap {
            (buf.len() - cap, &buf[buf.len() - cap..])
        } else {
            (0, buf)
        };
        self.written += skip as u64;
        let start = (self.written % cap as u64) as usize;
        let first = buf.len().min(cap - start);
        self.data[start..start + first].copy_from_slice(&buf[..first]);
        self.data[..buf.len() - first].copy_from_slice(&buf[first..]);
        self.written += buf.len() as u64;
    }

    fn copy_out(&self, from: u64, to: u64, out: &mut Vec<u8>) {
        let cap = self.capacity() as u64;
        let mut pos = from;
        while pos < to {
            let start = (pos % cap) as usize;
            let len = ((to - pos) as usize).min(self.capacity() - start);
            out.extend_from_slice(&self.data[start..start + len]);
            pos += len as u64;
        }
    }

    fn pid_mapping(&self) -> Vec<Pid> {
        let mut all = FixedBitSet::with_capacity(Pid::PID_COUNT);
        for sub in self.subscriptions.values() {
            all.union_with(&sub.pids);
        }
        all.ones().map(|p| Pid::new(p as u16)).collect()
    }
}

type PidMappingListener = Box<dyn Fn(&[Pid]) + Send + Sync>;

struct Shared {
    state: Mutex<RingState>,
    ready: Condvar,
    listener: Option<PidMappingListener>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_mapping(&self, state: &RingState) {
        if let Some(ref listener) = self.listener {
            listener(&state.pid_mapping()[..]);
        }
    }
}

/// The shared ring of transport stream data.  Cloning gives another handle to the same ring.
#[derive(Clone)]
pub struct SectionBuffer {
    shared: Arc<Shared>,
}

impl SectionBuffer {
    /// 1MiB, a little over 5500 packets
    pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

    /// Panics if `capacity` is smaller than one packet.
    pub fn new(capacity: usize) -> SectionBuffer {
        Self::build(capacity, None)
    }

    /// Like `new()`, but `listener` is invoked with the union of all subscribed PIDs whenever a
    /// reader is added, removed or changes its PIDs.  This is the hook through which the caller
    /// forwards `ChangePidMapping` to the tuner.
    pub fn with_pid_mapping_listener<F>(capacity: usize, listener: F) -> SectionBuffer
    where
        F: Fn(&[Pid]) + Send + Sync + 'static,
    {
        Self::build(capacity, Some(Box::new(listener)))
    }

    fn build(capacity: usize, listener: Option<PidMappingListener>) -> SectionBuffer {
        assert!(capacity >= Packet::SIZE);
        SectionBuffer {
            shared: Arc::new(Shared {
                state: Mutex::new(RingState {
                    data: vec![0; capacity],
                    written: 0,
                    overflowed: 0,
                    closed: false,
                    next_id: 0,
                    subscriptions: HashMap::new(),
                }),
                ready: Condvar::new(),
                listener,
            }),
        }
    }

    /// Called by the producer with newly received bytes, which need not be packet-aligned.  The
    /// oldest data is overwritten when the ring is full.
    pub fn push(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.shared.lock().write(data);
        self.shared.ready.notify_all();
    }

    /// Signal end-of-stream.  Readers drain what remains, then get `SourceError::Closed`.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.ready.notify_all();
    }

    /// Attach a new reader that will only see packets for the given PIDs, starting from data
    /// pushed after this call.
    pub fn subscribe(&self, pids: &[Pid]) -> BufferReader {
        let mut state = self.shared.lock();
        let id = state.next_id;
        state.next_id += 1;
        let cursor = state.written;
        state.subscriptions.insert(
            id,
            Subscription {
                pids: pid_set(pids),
                cursor,
            },
        );
        debug!(
            "buffer subscriber {} added for {:?}, total {}",
            id,
            pids,
            state.subscriptions.len()
        );
        self.shared.notify_mapping(&state);
        BufferReader {
            shared: self.shared.clone(),
            id,
            pids: pid_set(pids),
            cursor,
            pending: Vec::with_capacity(Packet::SIZE * 64),
            resyncs: 0,
            lost: 0,
        }
    }

    /// The union of the PIDs all current readers have asked for.
    pub fn pid_mapping(&self) -> Vec<Pid> {
        self.shared.lock().pid_mapping()
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.shared.lock();
        let slowest = state
            .subscriptions
            .values()
            .map(|s| s.cursor.max(state.oldest()))
            .min()
            .unwrap_or(state.written);
        BufferStats {
            capacity: state.capacity(),
            used: (state.written - slowest) as usize,
            written: state.written,
            overflowed: state.overflowed,
            subscribers: state.subscriptions.len(),
        }
    }
}

fn pid_set(pids: &[Pid]) -> FixedBitSet {
    let mut set = FixedBitSet::with_capacity(Pid::PID_COUNT);
    for &pid in pids {
        set.insert(usize::from(pid));
    }
    set
}

/// A PID-filtered view of a `SectionBuffer`.  Dropping the reader unsubscribes it.
pub struct BufferReader {
    shared: Arc<Shared>,
    id: u64,
    pids: FixedBitSet,
    cursor: u64,
    pending: Vec<u8>,
    resyncs: u64,
    lost: u64,
}

impl BufferReader {
    /// Number of times this reader had to search for a sync byte.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Bytes this reader missed because the ring overwrote them first.
    pub fn lost_bytes(&self) -> u64 {
        self.lost
    }

    fn extract_packets(&mut self, out: &mut Vec<u8>) -> usize {
        let mut pos = 0;
        let mut count = 0;
        while self.pending.len() - pos >= Packet::SIZE {
            if !Packet::is_sync_byte(self.pending[pos]) {
                self.resyncs += 1;
                pos = match find_sync(&self.pending[pos + 1..]) {
                    Some(off) => pos + 1 + off,
                    None => self.pending.len(),
                };
                continue;
            }
            let pk = Packet::new(&self.pending[pos..pos + Packet::SIZE]);
            if self.pids.contains(usize::from(pk.pid())) {
                out.extend_from_slice(pk.buffer());
                count += 1;
            }
            pos += Packet::SIZE;
        }
        self.pending.drain(..pos);
        count
    }
}

/// Find an offset that holds a sync byte, and where the following packet (if there is enough data
/// to tell) also starts with one.
fn find_sync(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).find(|&i| {
        Packet::is_sync_byte(buf[i])
            && buf
                .get(i + Packet::SIZE)
                .map(|&b| Packet::is_sync_byte(b))
                .unwrap_or(true)
    })
}

impl PacketSource for BufferReader {
    fn read_packets(&mut self, out: &mut Vec<u8>, timeout: Duration) -> Result<usize, SourceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut state = self.shared.lock();
            while state.written == self.cursor {
                if state.closed {
                    return Err(SourceError::Closed);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(0);
                }
                state = self
                    .shared
                    .ready
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            let oldest = state.oldest();
            if self.cursor < oldest {
                let lost = oldest - self.cursor;
                warn!(
                    "buffer subscriber {} overrun, {} bytes lost",
                    self.id, lost
                );
                state.overflowed += lost;
                self.lost += lost;
                self.cursor = oldest;
                self.pending.clear();
            }
            let written = state.written;
            state.copy_out(self.cursor, written, &mut self.pending);
            self.cursor = written;
            if let Some(sub) = state.subscriptions.get_mut(&self.id) {
                sub.cursor = written;
            }
            drop(state);

            let count = self.extract_packets(out);
            if count > 0 || Instant::now() >= deadline {
                return Ok(count);
            }
        }
    }

    fn change_pid_mapping(&mut self, pids: &[Pid]) {
        self.pids = pid_set(pids);
        let mut state = self.shared.lock();
        if let Some(sub) = state.subscriptions.get_mut(&self.id) {
            sub.pids = self.pids.clone();
        }
        self.shared.notify_mapping(&state);
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.subscriptions.remove(&self.id);
        debug!(
            "buffer subscriber {} removed, remaining {}",
            self.id,
            state.subscriptions.len()
        );
        self.shared.notify_mapping(&state);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn packet(pid: u16, fill: u8) -> Vec<u8> {
        let mut buf = vec![fill; Packet::SIZE];
        buf[0] = Packet::SYNC_BYTE;
        buf[1] = (pid >> 8) as u8 & 0b1_1111;
        buf[2] = pid as u8;
        buf[3] = 0b0001_0000;
        buf
    }

    #[test]
    fn filters_by_pid() {
        let ring = SectionBuffer::new(Packet::SIZE * 8);
        let mut reader = ring.subscribe(&[Pid::new(0x12)]);
        ring.push(&packet(0x11, 0)[..]);
        ring.push(&packet(0x12, 1)[..]);
        ring.push(&packet(0x13, 2)[..]);
        let mut out = vec![];
        let n = reader
            .read_packets(&mut out, Duration::from_millis(10))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(Packet::new(&out[..]).pid(), Pid::new(0x12));
    }

    #[test]
    fn packets_split_across_pushes() {
        let ring = SectionBuffer::new(Packet::SIZE * 8);
        let mut reader = ring.subscribe(&[Pid::new(0x12)]);
        let pk = packet(0x12, 7);
        ring.push(&pk[..100]);
        let mut out = vec![];
        assert_eq!(
            reader
                .read_packets(&mut out, Duration::from_millis(5))
                .unwrap(),
            0
        );
        ring.push(&pk[100..]);
        assert_eq!(
            reader
                .read_packets(&mut out, Duration::from_millis(5))
                .unwrap(),
            1
        );
        assert_eq!(out, pk);
    }

    #[test]
    fn resync_after_garbage() {
        let ring = SectionBuffer::new(Packet::SIZE * 8);
        let mut reader = ring.subscribe(&[Pid::new(0x12)]);
        ring.push(&[0x00, 0x01, 0x02][..]);
        ring.push(&packet(0x12, 0)[..]);
        ring.push(&packet(0x12, 0)[..]);
        let mut out = vec![];
        let n = reader
            .read_packets(&mut out, Duration::from_millis(10))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(reader.resyncs(), 1);
    }

    #[test]
    fn overrun_is_counted() {
        let ring = SectionBuffer::new(Packet::SIZE * 2);
        let mut reader = ring.subscribe(&[Pid::new(0x12)]);
        for _ in 0..3 {
            ring.push(&packet(0x12, 0)[..]);
        }
        let mut out = vec![];
        let n = reader
            .read_packets(&mut out, Duration::from_millis(10))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(reader.lost_bytes(), Packet::SIZE as u64);
        assert_eq!(ring.stats().overflowed, Packet::SIZE as u64);
    }

    #[test]
    fn closed_after_drain() {
        let ring = SectionBuffer::new(Packet::SIZE * 4);
        let mut reader = ring.subscribe(&[Pid::new(0x12)]);
        ring.push(&packet(0x12, 0)[..]);
        ring.close();
        let mut out = vec![];
        assert_eq!(
            reader
                .read_packets(&mut out, Duration::from_millis(10))
                .unwrap(),
            1
        );
        assert_matches!(
            reader.read_packets(&mut out, Duration::from_millis(10)),
            Err(SourceError::Closed)
        );
    }

    #[test]
    fn mapping_follows_subscribers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let ring = SectionBuffer::with_pid_mapping_listener(Packet::SIZE * 4, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let a = ring.subscribe(&[Pid::new(0xd2)]);
        let mut b = ring.subscribe(&[Pid::new(0xd3)]);
        assert_eq!(ring.pid_mapping(), vec![Pid::new(0xd2), Pid::new(0xd3)]);
        b.change_pid_mapping(&[Pid::new(0xd2)]);
        assert_eq!(ring.pid_mapping(), vec![Pid::new(0xd2)]);
        drop(a);
        drop(b);
        assert!(ring.pid_mapping().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(ring.stats().subscribers, 0);
    }
}
