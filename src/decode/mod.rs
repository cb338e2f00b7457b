//! Decoding of guide table sections into [`Record`](../record/enum.Record.html) values.
//!
//! Every protocol decoder walks a section payload with a bounds-checked [`Cursor`](struct.Cursor.html).
//! Nested structures that repeat a declared number of times implement [`Decode`](trait.Decode.html),
//! which takes the buffer and a start index and hands back the index where the caller should
//! continue reading.  [`decode_counted()`](fn.decode_counted.html) and
//! [`decode_until()`](fn.decode_until.html) chain these together.

pub mod atsc;
pub mod biop;
pub mod dish;
pub mod dvb;
pub mod fixup;
pub mod huffman;
pub mod mhw1;
pub mod mhw2;
pub mod opentv;
pub mod text;

use crate::context::ProtocolContext;
use crate::psi::{RawSection, TableFilter};
use crate::record::{Record, RecordKind, TitleRecord};
use chrono::{DateTime, NaiveDate, Utc};

/// Problems found while decoding a section payload.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload ended before the named field was complete.
    #[error("{field}: needed {needed} bytes, only {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },
    /// The named field holds a value that can't be right.
    #[error("{field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    /// The decoder was handed a section with a table_id it does not understand.
    #[error("unexpected table_id {0:#04x}")]
    UnexpectedTable(u8),
}

impl DecodeError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> DecodeError {
        DecodeError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// A read position within a byte buffer.  Every read names the field being read, so that a
/// short buffer produces a useful `DecodeError::Truncated`.
#[derive(Debug, Clone)]
pub struct Cursor<'buf> {
    buf: &'buf [u8],
    pos: usize,
}

impl<'buf> Cursor<'buf> {
    pub fn new(buf: &'buf [u8]) -> Cursor<'buf> {
        Cursor { buf, pos: 0 }
    }

    /// A cursor positioned at `index` within `buf`.
    pub fn at(buf: &'buf [u8], index: usize) -> Cursor<'buf> {
        Cursor { buf, pos: index }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, field: &'static str, len: usize) -> Result<&'buf [u8], DecodeError> {
        let end = self.pos.checked_add(len).unwrap_or(usize::MAX);
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                field,
                needed: end,
                available: self.buf.len(),
            });
        }
        let data = &self.buf[self.pos..end];
        self.pos = end;
        Ok(data)
    }

    pub fn skip(&mut self, field: &'static str, len: usize) -> Result<(), DecodeError> {
        self.bytes(field, len).map(|_| ())
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.bytes(field, 1)?[0])
    }

    pub fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        let b = self.bytes(field, 2)?;
        Ok(u16::from(b[0]) << 8 | u16::from(b[1]))
    }

    pub fn u24(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let b = self.bytes(field, 3)?;
        Ok(u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]))
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let b = self.bytes(field, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// The low 12 bits of a 16-bit field, the usual encoding of a descriptor loop length.
    pub fn len12(&mut self, field: &'static str) -> Result<usize, DecodeError> {
        Ok(usize::from(self.u16(field)? & 0x0fff))
    }

    /// Take the next `len` bytes as a cursor of their own, advancing this one past them.
    pub fn sub(&mut self, field: &'static str, len: usize) -> Result<Cursor<'buf>, DecodeError> {
        self.bytes(field, len).map(Cursor::new)
    }

    /// Everything not yet read.
    pub fn rest(&mut self) -> &'buf [u8] {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        rest
    }
}

/// A structure which appears nested inside a table, decoded starting at `index` within `buf`.
/// The returned `usize` is the index just past the end of the structure.
pub trait Decode: Sized {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError>;
}

/// Decode `count` consecutive instances of `T`, each starting where the previous one ended.
pub fn decode_counted<T: Decode>(
    buf: &[u8],
    mut index: usize,
    count: usize,
) -> Result<(Vec<T>, usize), DecodeError> {
    let mut items = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let (item, next) = T::decode(buf, index)?;
        items.push(item);
        index = next;
    }
    Ok((items, index))
}

/// Decode instances of `T` until the read position reaches `end`.  Items may not extend past
/// `end`.
pub fn decode_until<T: Decode>(
    buf: &[u8],
    mut index: usize,
    end: usize,
) -> Result<(Vec<T>, usize), DecodeError> {
    if end > buf.len() {
        return Err(DecodeError::Truncated {
            field: "loop_length",
            needed: end,
            available: buf.len(),
        });
    }
    let bounded = &buf[..end];
    let mut items = vec![];
    while index < end {
        let (item, next) = T::decode(bounded, index)?;
        if next <= index {
            return Err(DecodeError::invalid("loop_length", "zero length item"));
        }
        items.push(item);
        index = next;
    }
    Ok((items, index))
}

/// Decode a single binary-coded-decimal byte.
pub fn bcd_byte(field: &'static str, b: u8) -> Result<u8, DecodeError> {
    let hi = b >> 4;
    let lo = b & 0x0f;
    if hi > 9 || lo > 9 {
        return Err(DecodeError::invalid(
            field,
            format!("invalid BCD byte {:#04x}", b),
        ));
    }
    Ok(hi * 10 + lo)
}

/// Decode 6 BCD digits `hhmmss` into a duration.
pub fn bcd_hms(field: &'static str, v: u32) -> Result<chrono::Duration, DecodeError> {
    let h = bcd_byte(field, (v >> 16) as u8)?;
    let m = bcd_byte(field, (v >> 8) as u8)?;
    let s = bcd_byte(field, v as u8)?;
    if m > 59 || s > 59 {
        return Err(DecodeError::invalid(
            field,
            format!("time {:06x} out of range", v),
        ));
    }
    Ok(chrono::Duration::seconds(
        i64::from(h) * 3600 + i64::from(m) * 60 + i64::from(s),
    ))
}

/// Convert a Modified Julian Date to a calendar date.
pub fn mjd_to_date(mjd: u16) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1858, 11, 17)?
        .checked_add_signed(chrono::Duration::days(i64::from(mjd)))
}

/// The 40-bit DVB `UTC_time` encoding: 16 bits of MJD followed by 6 BCD digits.
pub fn dvb_time(field: &'static str, mjd: u16, bcd: u32) -> Result<DateTime<Utc>, DecodeError> {
    let date = mjd_to_date(mjd)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| DecodeError::invalid(field, format!("bad MJD {}", mjd)))?;
    let time = bcd_hms(field, bcd)?;
    Ok(date.and_utc() + time)
}

/// Seconds between the Unix epoch and the GPS epoch of 1980-01-06T00:00:00Z.
const GPS_EPOCH_UNIX: i64 = 315_964_800;

/// Convert an ATSC GPS-seconds timestamp to UTC, given the current GPS-UTC leap second offset.
pub fn gps_to_utc(gps_seconds: u32, gps_utc_offset: u8) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(
        GPS_EPOCH_UNIX + i64::from(gps_seconds) - i64::from(gps_utc_offset),
        0,
    )
}

/// The result of decoding one section.  Records that fail validation are set aside in `rejected`
/// without affecting the rest of the section.
#[derive(Debug, Default)]
pub struct Decoded {
    pub records: Vec<Record>,
    pub rejected: Vec<DecodeError>,
}

impl Decoded {
    /// Validate the record and keep it, or keep the validation error instead.
    pub fn accept(&mut self, record: Record) {
        match record.validate() {
            Ok(()) => self.records.push(record),
            Err(e) => self.rejected.push(e),
        }
    }

    /// Like `accept()` for a title, but the title's category only counts as used once the title
    /// has validated.
    pub fn accept_title(&mut self, ctx: &mut ProtocolContext, title: TitleRecord) {
        match title.validate() {
            Ok(()) => {
                if let Some(code) = title.category {
                    ctx.categorise(code, &title.event_name);
                }
                self.records.push(Record::Title(title));
            }
            Err(e) => self.rejected.push(e),
        }
    }

    /// Keep a record that was produced by a fallible per-record decode step.
    pub fn accept_result(&mut self, result: Result<Record, DecodeError>) {
        match result {
            Ok(record) => self.accept(record),
            Err(e) => self.rejected.push(e),
        }
    }

    pub fn reject(&mut self, err: DecodeError) {
        self.rejected.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.rejected.is_empty()
    }
}

/// Decodes the sections of one kind of table.
///
/// A decoder may keep state between sections (object carousel module reassembly, for example),
/// so `decode()` takes `&mut self`.
pub trait TableDecoder: Send {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// The table_id values this decoder handles.  Sections with other ids are filtered out
    /// during reassembly.
    fn table_ids(&self) -> TableFilter;

    fn decode(
        &mut self,
        ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError>;

    /// The kind of record whose count is watched to decide whether collection has converged.
    fn counted_kind(&self) -> RecordKind;

    /// Whether seeing every section from 0 up to `last_section_number` means the table is
    /// complete.  True for long form tables that are not segmented.
    fn completes_on_last_section(&self) -> bool {
        false
    }

    /// Decoders that know when they have everything (as the object carousel does once every
    /// announced module has arrived) return true from here.
    fn is_complete(&self) -> bool {
        false
    }
}

/// Fail with `UnexpectedTable` unless `decoder` handles the section's table_id.
pub(crate) fn expect_table<D: TableDecoder + ?Sized>(
    decoder: &D,
    section: &RawSection,
) -> Result<(), DecodeError> {
    if decoder.table_ids().accepts(section.table_id) {
        Ok(())
    } else {
        Err(DecodeError::UnexpectedTable(section.table_id))
    }
}

#[cfg(test)]
pub(crate) fn make_test_data<F>(builder: F) -> Vec<u8>
where
    F: Fn(&mut bitstream_io::BitWriter<Vec<u8>, bitstream_io::BE>) -> Result<(), std::io::Error>,
{
    let data: Vec<u8> = Vec::new();
    let mut w = bitstream_io::BitWriter::endian(data, bitstream_io::BigEndian);
    builder(&mut w).unwrap();
    w.into_writer()
}
