#![no_main]

use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use mpeg2ts_epg::context::ProtocolContext;
use mpeg2ts_epg::decode::atsc::{AtscEitDecoder, EttDecoder, MgtDecoder, VctDecoder};
use mpeg2ts_epg::decode::biop::CarouselDecoder;
use mpeg2ts_epg::decode::dish::DishEitDecoder;
use mpeg2ts_epg::decode::dvb::{EitDecoder, NitDecoder, PatDecoder, SdtDecoder};
use mpeg2ts_epg::decode::mhw1::{
    Mhw1ChannelDecoder, Mhw1SummaryDecoder, Mhw1ThemeDecoder, Mhw1TitleDecoder,
};
use mpeg2ts_epg::decode::mhw2::{
    Mhw2ChannelDecoder, Mhw2SummaryDecoder, Mhw2ThemeDecoder, Mhw2TitleDecoder,
};
use mpeg2ts_epg::decode::opentv::{
    OpenTvChannelDecoder, OpenTvSummaryDecoder, OpenTvTitleDecoder,
};
use mpeg2ts_epg::decode::TableDecoder;
use mpeg2ts_epg::packet::Packet;
use mpeg2ts_epg::psi::{SectionReassembler, TableFilter};

fn decoders() -> Vec<Box<dyn TableDecoder>> {
    vec![
        Box::new(PatDecoder),
        Box::new(NitDecoder::all()),
        Box::new(SdtDecoder::all()),
        Box::new(EitDecoder::all()),
        Box::new(MgtDecoder),
        Box::new(VctDecoder),
        Box::new(AtscEitDecoder),
        Box::new(EttDecoder),
        Box::new(Mhw1ChannelDecoder),
        Box::new(Mhw1ThemeDecoder),
        Box::new(Mhw1TitleDecoder),
        Box::new(Mhw1SummaryDecoder),
        Box::new(Mhw2ChannelDecoder),
        Box::new(Mhw2ThemeDecoder),
        Box::new(Mhw2TitleDecoder),
        Box::new(Mhw2SummaryDecoder),
        Box::new(OpenTvChannelDecoder),
        Box::new(OpenTvTitleDecoder),
        Box::new(OpenTvSummaryDecoder),
        Box::new(DishEitDecoder::default()),
        Box::new(CarouselDecoder::new()),
    ]
}

fuzz_target!(|data: &[u8]| {
    let mut ctx = ProtocolContext::new(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    let mut decoders = decoders();
    let mut reassembler = SectionReassembler::new();
    let mut sections = vec![];
    for pk in data.chunks_exact(Packet::SIZE).filter_map(Packet::try_new) {
        if !reassembler.watched().any(|pid| pid == pk.pid()) {
            reassembler.watch(pk.pid(), TableFilter::all());
        }
        sections.extend(reassembler.feed(&pk));
    }
    for section in &sections {
        for decoder in decoders.iter_mut() {
            if decoder.table_ids().accepts(section.table_id) {
                let _ = decoder.decode(&mut ctx, section);
            }
        }
    }
});
