//! Collect the guide of one protocol from a transport stream file, replaying the file until
//! collection finishes, then print what was found.
//!
//!     RUST_LOG=info cargo run --example scan -- capture.ts dvb

use chrono::Utc;
use mpeg2ts_epg::acquire::protocol::Protocol;
use mpeg2ts_epg::acquire::AcquisitionConfig;
use mpeg2ts_epg::buffer::SectionBuffer;
use mpeg2ts_epg::context::ProtocolContext;
use mpeg2ts_epg::packet::{Packet, Pid};
use mpeg2ts_epg::record::RecordKind;
use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{env, process, thread};

fn protocol(name: &str) -> Option<Protocol> {
    Some(match name {
        "dvb" => Protocol::Dvb,
        "atsc" => Protocol::Atsc,
        "mhw1" => Protocol::MediaHighway1,
        "mhw2" => Protocol::MediaHighway2,
        "opentv" => Protocol::OpenTv,
        "dish" => Protocol::DishNetwork,
        other => {
            let pid = other.strip_prefix("carousel:")?;
            let pid = u16::from_str_radix(pid.trim_start_matches("0x"), 16).ok()?;
            Protocol::ObjectCarousel { pid: Pid::new(pid) }
        }
    })
}

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: {} <file.ts> <dvb|atsc|mhw1|mhw2|opentv|dish|carousel:PID>", args[0]);
        process::exit(1);
    }
    let protocol = protocol(&args[2]).unwrap_or_else(|| {
        eprintln!("unknown protocol {:?}", args[2]);
        process::exit(1)
    });
    let mut data = vec![];
    File::open(&args[1])
        .and_then(|mut f| f.read_to_end(&mut data))
        .unwrap_or_else(|e| {
            eprintln!("{}: {}", args[1], e);
            process::exit(1)
        });

    let ring = SectionBuffer::new(SectionBuffer::DEFAULT_CAPACITY);
    let done = Arc::new(AtomicBool::new(false));
    let feeder = {
        let ring = ring.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                for chunk in data.chunks(Packet::SIZE * 64) {
                    if done.load(Ordering::Acquire) {
                        break;
                    }
                    ring.push(chunk);
                    thread::sleep(Duration::from_millis(1));
                }
            }
            ring.close();
        })
    };

    let config = AcquisitionConfig::default().with_time_limit(Duration::from_secs(120));
    let mut collector = protocol.collector(ProtocolContext::new(Utc::now()), config);
    let result = collector.process(&ring);
    done.store(true, Ordering::Release);
    feeder.join().expect("feeder thread panicked");
    if let Err(e) = result {
        eprintln!("{}: {}", protocol, e);
        process::exit(1);
    }

    let guide = collector.finish_frequency();
    println!("{}", guide.protocol);
    for t in &guide.tables {
        println!(
            "  stage {} {:<20} {:?} sections={} failures={}",
            t.stage, t.table, t.outcome, t.stats.sections, t.stats.decode_failures
        );
    }
    for kind in RecordKind::ALL {
        let n = guide.records.count(kind);
        if n > 0 {
            println!("  {:<16} {}", kind.to_string(), n);
        }
    }
    for c in guide.records.channels().take(20) {
        println!("  channel {:>5} {}", c.user_channel_number.unwrap_or(0), c.name);
    }
    if !guide.undefined_categories.is_empty() {
        println!("  {} undefined categories", guide.undefined_categories.len());
    }
}
