use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use mpeg2ts_epg::context::ProtocolContext;
use mpeg2ts_epg::decode::dvb::EitDecoder;
use mpeg2ts_epg::decode::TableDecoder;
use mpeg2ts_epg::packet::{Packet, Pid};
use mpeg2ts_epg::psi::{RawSection, SectionReassembler, TableFilter};

const EVENTS_PER_SECTION: u16 = 20;
const SECTIONS: u8 = 64;

fn eit_payload(section_number: u8) -> Vec<u8> {
    let mut payload = vec![0x00, 0x03, 0x23, 0x3a, SECTIONS - 1, 0x4e];
    for i in 0..EVENTS_PER_SECTION {
        let event_id = u16::from(section_number) * EVENTS_PER_SECTION + i;
        payload.extend_from_slice(&event_id.to_be_bytes());
        payload.extend_from_slice(&[0xc0, 0x79]); // MJD 1993-10-13
        payload.extend_from_slice(&[0x12, 0x45, 0x00, 0x01, 0x30, 0x00]);
        payload.extend_from_slice(&[0x80, 44]);
        payload.extend_from_slice(b"\x4d\x10eng\x05News \x06Headln");
        payload.extend_from_slice(&[0x54, 0x02, 0x23, 0x00]);
        payload.extend_from_slice(b"\x76\x08\xc8\x03/s1\xc5\x01\x02");
        payload.extend_from_slice(b"\x4e\x0a\x12eng\x00\x04Text");
    }
    payload
}

fn packetise(pid: Pid, section: &[u8], cc: &mut u8, out: &mut Vec<u8>) {
    let mut rest = section;
    let mut first = true;
    while first || !rest.is_empty() {
        let start = out.len();
        out.resize(start + Packet::SIZE, 0xff);
        let buf = &mut out[start..];
        buf[0] = Packet::SYNC_BYTE;
        buf[1] = (u16::from(pid) >> 8) as u8 | if first { 0b0100_0000 } else { 0 };
        buf[2] = u16::from(pid) as u8;
        buf[3] = 0b0001_0000 | *cc;
        let mut at = 4;
        if first {
            buf[at] = 0;
            at += 1;
        }
        let n = rest.len().min(Packet::SIZE - at);
        buf[at..at + n].copy_from_slice(&rest[..n]);
        rest = &rest[n..];
        *cc = (*cc + 1) & 0b1111;
        first = false;
    }
}

fn eit_stream() -> Vec<u8> {
    let mut out = vec![];
    let mut cc = 0;
    for section_number in 0..SECTIONS {
        let section = RawSection::long(
            Pid::EIT,
            0x50,
            0x1044,
            1,
            section_number,
            SECTIONS - 1,
            &eit_payload(section_number),
        );
        packetise(Pid::EIT, &section.to_bytes(), &mut cc, &mut out);
    }
    out
}

fn reassemble(stream: &[u8]) -> Vec<RawSection> {
    let mut reassembler = SectionReassembler::new();
    reassembler.watch(Pid::EIT, TableFilter::range(0x4e..=0x6f));
    let mut sections = vec![];
    for pk in stream.chunks_exact(Packet::SIZE).filter_map(Packet::try_new) {
        sections.extend(reassembler.feed(&pk));
    }
    sections
}

fn reassembly(c: &mut Criterion) {
    let stream = eit_stream();
    let mut group = c.benchmark_group("reassembly");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("eit", |b| {
        b.iter(|| reassemble(&stream));
    });
    group.finish();
}

fn eit_decode(c: &mut Criterion) {
    let sections = reassemble(&eit_stream());
    assert_eq!(sections.len(), usize::from(SECTIONS));
    let mut ctx = ProtocolContext::new(Utc.with_ymd_and_hms(1993, 10, 13, 0, 0, 0).unwrap());
    let mut decoder = EitDecoder::all();
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(
        u64::from(SECTIONS) * u64::from(EVENTS_PER_SECTION),
    ));
    group.bench_function("eit", |b| {
        b.iter(|| {
            for section in &sections {
                let _ = decoder.decode(&mut ctx, section);
            }
        });
    });
    group.finish();
}

criterion_group!(benches, reassembly, eit_decode);
criterion_main!(benches);
