//! Electronic Program Guide acquisition from the sections of an MPEG2 Transport Stream.
//!
//! Channel lists, categories, event titles and summaries are collected from a tuned frequency in
//! several broadcast guide formats: DVB SI, ATSC PSIP, MediaHighway 1 and 2, OpenTV, Dish
//! Network and DSM-CC object carousels.
//!
//! # Design principals
//!
//!  * *Transport Neutral*.  Packets are pushed into a [`SectionBuffer`](buffer/struct.SectionBuffer.html)
//!    by the caller, from a tuner device, a file, or the network.  Nothing here opens a device.
//!  * *Decoders are pure*.  A decoder turns one validated section into guide records, and never
//!    blocks or touches the store.  Shared state (text dictionaries, category usage) lives in an
//!    explicit [`ProtocolContext`](context/struct.ProtocolContext.html).
//!  * *Bad data is counted, not fatal*.  Broadcast data is often malformed.  A malformed record is
//!    rejected with a descriptive error and collection carries on.
//!
//! # Core types
//!
//!  * [`SectionReassembler`](psi/reassemble/struct.SectionReassembler.html) turns packets into
//!    deduplicated [`RawSection`](psi/struct.RawSection.html) values
//!  * [`TableDecoder`](decode/trait.TableDecoder.html) implementations turn sections into
//!    [`Record`](record/enum.Record.html) values
//!  * [`TableAcquisition`](acquire/struct.TableAcquisition.html) runs reader threads for a table
//!    until its content stops changing
//!  * [`ProtocolCollector`](acquire/protocol/trait.ProtocolCollector.html) sequences the tables
//!    of one protocol and merges everything into a [`RecordStore`](store/struct.RecordStore.html)

#![forbid(unsafe_code)]

pub mod acquire;
pub mod buffer;
pub mod context;
pub mod decode;
pub mod descriptor;
pub mod packet;
pub mod psi;
pub mod record;
pub mod store;
