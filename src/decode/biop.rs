//! DSM-CC object carousels, per _ISO/IEC 13818-6_ and _ETSI TR 101 202_, as used to deliver
//! MHEG-5 guide applications.
//!
//! The download info indication (DII) announces a set of modules; each module is then broadcast
//! in fixed size blocks by download data blocks (DDB).  Once every block of a module has arrived,
//! the module is decoded as a sequence of BIOP messages, each of which describes one object:
//! a file, a directory, or the service gateway (root directory).  Directories bind names to
//! interoperable object references (IORs) that locate their children in other modules.

use super::{decode_counted, expect_table, Cursor, Decode, DecodeError, Decoded, TableDecoder};
use crate::context::ProtocolContext;
use crate::descriptor::{DescriptorIter, UnknownDescriptor};
use crate::psi::{RawSection, TableFilter};
use crate::record::{CarouselContent, CarouselObjectRecord, Record, RecordKind};
use fixedbitset::FixedBitSet;
use log::{debug, trace, warn};
use std::collections::{BTreeMap, BTreeSet};

/// Download server initiate and download info indication messages.
pub const DSI_DII_TABLE_ID: u8 = 0x3b;
/// Download data blocks.
pub const DDB_TABLE_ID: u8 = 0x3c;

const PROTOCOL_DISCRIMINATOR: u8 = 0x11;
const DSMCC_TYPE_DOWNLOAD: u8 = 0x03;
const DII_MESSAGE: u16 = 0x1002;
const DDB_MESSAGE: u16 = 0x1003;
const DSI_MESSAGE: u16 = 0x1006;

const BIOP_PROFILE_TAG: u32 = 0x4953_4f06;
const LITE_OPTIONS_PROFILE_TAG: u32 = 0x4953_4f05;
const OBJECT_LOCATION_TAG: u32 = 0x4953_4f50;
const CONN_BINDER_TAG: u32 = 0x4953_4f40;

const COMPRESSED_MODULE_TAG: u8 = 0x09;
/// Largest module buffered for reassembly.
const MAX_MODULE_SIZE: usize = 16 * 1024 * 1024;
/// block_number is 16 bits
const MAX_BLOCKS: u64 = 1 << 16;

/// The length-prefixed strings in BIOP are usually NUL terminated.
fn trim_nul(bytes: &[u8]) -> &[u8] {
    match bytes.split_last() {
        Some((0, rest)) => rest,
        _ => bytes,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Directory,
    ServiceGateway,
    Stream,
    StreamEvent,
    Other(String),
}

impl ObjectKind {
    pub fn from_bytes(bytes: &[u8]) -> ObjectKind {
        match trim_nul(bytes) {
            b"fil" => ObjectKind::File,
            b"dir" => ObjectKind::Directory,
            b"srg" => ObjectKind::ServiceGateway,
            b"str" => ObjectKind::Stream,
            b"ste" => ObjectKind::StreamEvent,
            other => ObjectKind::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

/// The DSM-CC message header which starts every DSI, DII and DDB.
#[derive(Debug)]
struct MessageHeader {
    message_id: u16,
    transaction_id: u32,
}

impl Decode for MessageHeader {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let protocol = c.u8("protocol_discriminator")?;
        if protocol != PROTOCOL_DISCRIMINATOR {
            return Err(DecodeError::invalid(
                "protocol_discriminator",
                format!("{:#04x}", protocol),
            ));
        }
        let dsmcc_type = c.u8("dsmcc_type")?;
        if dsmcc_type != DSMCC_TYPE_DOWNLOAD {
            return Err(DecodeError::invalid(
                "dsmcc_type",
                format!("{:#04x}", dsmcc_type),
            ));
        }
        let message_id = c.u16("message_id")?;
        let transaction_id = c.u32("transaction_id")?;
        c.skip("reserved", 1)?;
        let adaptation_len = usize::from(c.u8("adaptation_length")?);
        c.skip("message_length", 2)?;
        c.skip("adaptation", adaptation_len)?;
        Ok((
            MessageHeader {
                message_id,
                transaction_id,
            },
            c.position(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tap {
    pub id: u16,
    pub tap_use: u16,
    pub association_tag: u16,
    pub selector: Vec<u8>,
}

impl Decode for Tap {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let id = c.u16("tap_id")?;
        let tap_use = c.u16("tap_use")?;
        let association_tag = c.u16("association_tag")?;
        let len = usize::from(c.u8("selector_length")?);
        let selector = c.bytes("selector", len)?.to_vec();
        Ok((
            Tap {
                id,
                tap_use,
                association_tag,
                selector,
            },
            c.position(),
        ))
    }
}

/// Where in the carousel an object is to be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub carousel_id: u32,
    pub module_id: u16,
    pub version: (u8, u8),
    pub object_key: Vec<u8>,
}

impl Decode for ObjectLocation {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let carousel_id = c.u32("carousel_id")?;
        let module_id = c.u16("module_id")?;
        let major = c.u8("version_major")?;
        let minor = c.u8("version_minor")?;
        let key_len = usize::from(c.u8("object_key_length")?);
        let object_key = c.bytes("object_key", key_len)?.to_vec();
        Ok((
            ObjectLocation {
                carousel_id,
                module_id,
                version: (major, minor),
                object_key,
            },
            c.position(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiteComponent {
    ObjectLocation(ObjectLocation),
    ConnBinder(Vec<Tap>),
    Other { tag: u32, data: Vec<u8> },
}

impl Decode for LiteComponent {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let tag = c.u32("component_tag")?;
        let len = usize::from(c.u8("component_data_length")?);
        let data = c.bytes("component_data", len)?;
        let component = match tag {
            OBJECT_LOCATION_TAG => LiteComponent::ObjectLocation(ObjectLocation::decode(data, 0)?.0),
            CONN_BINDER_TAG => {
                let count = usize::from(Cursor::new(data).u8("taps_count")?);
                LiteComponent::ConnBinder(decode_counted::<Tap>(data, 1, count)?.0)
            }
            _ => LiteComponent::Other {
                tag,
                data: data.to_vec(),
            },
        };
        Ok((component, c.position()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaggedProfile {
    Biop {
        byte_order: u8,
        components: Vec<LiteComponent>,
    },
    LiteOptions(Vec<u8>),
    Other {
        tag: u32,
        data: Vec<u8>,
    },
}

impl Decode for TaggedProfile {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let tag = c.u32("profile_id_tag")?;
        let len = c.u32("profile_data_length")? as usize;
        let data = c.bytes("profile_data", len)?;
        let profile = match tag {
            BIOP_PROFILE_TAG => {
                let mut p = Cursor::new(data);
                let byte_order = p.u8("profile_data_byte_order")?;
                let count = usize::from(p.u8("lite_component_count")?);
                let (components, _) = decode_counted::<LiteComponent>(data, p.position(), count)?;
                TaggedProfile::Biop {
                    byte_order,
                    components,
                }
            }
            LITE_OPTIONS_PROFILE_TAG => TaggedProfile::LiteOptions(data.to_vec()),
            _ => TaggedProfile::Other {
                tag,
                data: data.to_vec(),
            },
        };
        Ok((profile, c.position()))
    }
}

/// Interoperable object reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ior {
    pub type_id: ObjectKind,
    pub profiles: Vec<TaggedProfile>,
}

impl Decode for Ior {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let type_len = c.u32("type_id_length")? as usize;
        let type_id = ObjectKind::from_bytes(c.bytes("type_id", type_len)?);
        let count = c.u32("tagged_profiles_count")? as usize;
        let (profiles, next) = decode_counted::<TaggedProfile>(buf, c.position(), count)?;
        Ok((Ior { type_id, profiles }, next))
    }
}

impl Ior {
    fn components(&self) -> impl Iterator<Item = &LiteComponent> {
        self.profiles
            .iter()
            .filter_map(|p| match p {
                TaggedProfile::Biop { components, .. } => Some(components.iter()),
                _ => None,
            })
            .flatten()
    }

    /// The object's location, from the first BIOP profile that gives one.
    pub fn location(&self) -> Option<&ObjectLocation> {
        self.components().find_map(|c| match c {
            LiteComponent::ObjectLocation(loc) => Some(loc),
            _ => None,
        })
    }

    pub fn taps(&self) -> impl Iterator<Item = &Tap> {
        self.components()
            .filter_map(|c| match c {
                LiteComponent::ConnBinder(taps) => Some(taps.iter()),
                _ => None,
            })
            .flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameComponent {
    pub id: String,
    pub kind: ObjectKind,
}

impl Decode for NameComponent {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let id_len = usize::from(c.u8("id_length")?);
        let id = String::from_utf8_lossy(trim_nul(c.bytes("id", id_len)?)).into_owned();
        let kind_len = usize::from(c.u8("kind_length")?);
        let kind = ObjectKind::from_bytes(c.bytes("kind", kind_len)?);
        Ok((NameComponent { id, kind }, c.position()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    /// Names a leaf object such as a file.
    Object,
    /// Names a directory.
    Context,
    Other(u8),
}

impl From<u8> for BindingType {
    fn from(v: u8) -> Self {
        match v {
            0x01 => BindingType::Object,
            0x02 => BindingType::Context,
            _ => BindingType::Other(v),
        }
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: Vec<NameComponent>,
    pub binding_type: BindingType,
    pub ior: Ior,
    pub object_info: Vec<u8>,
}

impl Binding {
    /// The name components joined with `/`.
    pub fn path(&self) -> String {
        self.name
            .iter()
            .map(|n| n.id.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl Decode for Binding {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let count = usize::from(c.u8("name_components_count")?);
        let (name, next) = decode_counted::<NameComponent>(buf, c.position(), count)?;
        let mut c = Cursor::at(buf, next);
        let binding_type = BindingType::from(c.u8("binding_type")?);
        let (ior, next) = Ior::decode(buf, c.position())?;
        let mut c = Cursor::at(buf, next);
        let info_len = usize::from(c.u16("object_info_length")?);
        let object_info = c.bytes("object_info", info_len)?.to_vec();
        Ok((
            Binding {
                name,
                binding_type,
                ior,
                object_info,
            },
            c.position(),
        ))
    }
}

/// One BIOP message from a module.
struct BiopMessage {
    object_key: Vec<u8>,
    kind: ObjectKind,
    content: CarouselContent,
}

impl Decode for BiopMessage {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        if c.bytes("magic", 4)? != b"BIOP" {
            return Err(DecodeError::invalid("magic", "not a BIOP message"));
        }
        let version = (c.u8("biop_version_major")?, c.u8("biop_version_minor")?);
        if version != (1, 0) {
            return Err(DecodeError::invalid(
                "biop_version",
                format!("{}.{}", version.0, version.1),
            ));
        }
        if c.u8("byte_order")? != 0 {
            return Err(DecodeError::invalid(
                "byte_order",
                "little endian messages are not supported",
            ));
        }
        c.skip("message_type", 1)?;
        let size = c.u32("message_size")? as usize;
        let mut m = c.sub("message", size)?;
        let key_len = usize::from(m.u8("object_key_length")?);
        let object_key = m.bytes("object_key", key_len)?.to_vec();
        let kind_len = m.u32("object_kind_length")? as usize;
        let kind = ObjectKind::from_bytes(m.bytes("object_kind", kind_len)?);
        let info_len = usize::from(m.u16("object_info_length")?);
        m.skip("object_info", info_len)?;
        let contexts = m.u8("service_context_list_count")?;
        for _ in 0..contexts {
            m.skip("context_id", 4)?;
            let len = usize::from(m.u16("context_data_length")?);
            m.skip("context_data", len)?;
        }
        let body_len = m.u32("message_body_length")? as usize;
        let body = m.bytes("message_body", body_len)?;
        let content = match kind {
            ObjectKind::File => {
                let mut b = Cursor::new(body);
                let len = b.u32("content_length")? as usize;
                CarouselContent::File(b.bytes("content", len)?.to_vec())
            }
            ObjectKind::Directory | ObjectKind::ServiceGateway => {
                let count = usize::from(Cursor::new(body).u16("bindings_count")?);
                CarouselContent::Directory(decode_counted::<Binding>(body, 2, count)?.0)
            }
            _ => CarouselContent::Other(body.to_vec()),
        };
        Ok((
            BiopMessage {
                object_key,
                kind,
                content,
            },
            c.position(),
        ))
    }
}

/// A module as announced in the DII.
#[derive(Debug)]
struct DiiModule {
    module_id: u16,
    size: usize,
    version: u8,
    taps: Vec<Tap>,
    compressed: bool,
}

impl Decode for DiiModule {
    fn decode(buf: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::at(buf, index);
        let module_id = c.u16("module_id")?;
        let size = c.u32("module_size")? as usize;
        let version = c.u8("module_version")?;
        let info_len = usize::from(c.u8("module_info_length")?);
        let info = c.bytes("module_info", info_len)?;
        let mut module = DiiModule {
            module_id,
            size,
            version,
            taps: vec![],
            compressed: false,
        };
        if !info.is_empty() {
            // BIOP::ModuleInfo
            let mut i = Cursor::new(info);
            i.skip("timeouts", 12)?;
            let taps = usize::from(i.u8("taps_count")?);
            let (taps, next) = decode_counted::<Tap>(info, i.position(), taps)?;
            let mut i = Cursor::at(info, next);
            let user_len = usize::from(i.u8("user_info_length")?);
            let user_info = i.bytes("user_info", user_len)?;
            module.taps = taps;
            module.compressed = DescriptorIter::<UnknownDescriptor<'_>>::new(user_info)
                .filter_map(Result::ok)
                .any(|d| d.tag == COMPRESSED_MODULE_TAG);
        }
        Ok((module, c.position()))
    }
}

/// Reassembly state of one module.
#[derive(Debug)]
struct ModuleState {
    version: u8,
    size: usize,
    block_size: usize,
    blocks: FixedBitSet,
    data: Vec<u8>,
    complete: bool,
}

/// Decodes the DSI, DII and DDB messages of one object carousel, reassembling modules from
/// their blocks.
#[derive(Debug, Default)]
pub struct CarouselDecoder {
    modules: BTreeMap<u16, ModuleState>,
    compressed: BTreeSet<u16>,
    announced: bool,
    service_gateway: Option<ObjectLocation>,
}

impl CarouselDecoder {
    pub fn new() -> CarouselDecoder {
        CarouselDecoder::default()
    }

    /// Location of the root directory, once a DSI has been seen.
    pub fn service_gateway(&self) -> Option<&ObjectLocation> {
        self.service_gateway.as_ref()
    }

    /// `(complete, announced)` module counts.
    pub fn progress(&self) -> (usize, usize) {
        let complete = self.modules.values().filter(|m| m.complete).count();
        (complete, self.modules.len())
    }

    fn dsi(&mut self, payload: &[u8], index: usize) -> Result<(), DecodeError> {
        let mut c = Cursor::at(payload, index);
        c.skip("server_id", 20)?;
        let compat = usize::from(c.u16("compatibility_descriptor_length")?);
        c.skip("compatibility_descriptor", compat)?;
        let private_len = usize::from(c.u16("private_data_length")?);
        let private = c.bytes("private_data", private_len)?;
        let (ior, _) = Ior::decode(private, 0)?;
        if let Some(loc) = ior.location() {
            debug!(
                "service gateway in module {} of carousel {}",
                loc.module_id, loc.carousel_id
            );
        }
        self.service_gateway = ior.location().cloned();
        Ok(())
    }

    fn dii(&mut self, payload: &[u8], index: usize, out: &mut Decoded) -> Result<(), DecodeError> {
        let mut c = Cursor::at(payload, index);
        let download_id = c.u32("download_id")?;
        let block_size = usize::from(c.u16("block_size")?);
        if block_size == 0 {
            return Err(DecodeError::invalid("block_size", "zero"));
        }
        // window_size, ack_period, tc_download_window, tc_download_scenario
        c.skip("download_window", 10)?;
        let compat = usize::from(c.u16("compatibility_descriptor_length")?);
        c.skip("compatibility_descriptor", compat)?;
        let count = usize::from(c.u16("number_of_modules")?);
        let (modules, _) = decode_counted::<DiiModule>(payload, c.position(), count)?;
        self.announced = true;
        for m in modules {
            if m.compressed {
                if self.compressed.insert(m.module_id) {
                    out.reject(DecodeError::invalid(
                        "compressed_module",
                        format!("module {} is compressed", m.module_id),
                    ));
                }
                continue;
            }
            if self.modules.get(&m.module_id).map(|s| s.version) == Some(m.version) {
                continue;
            }
            if m.size > MAX_MODULE_SIZE || m.size as u64 > block_size as u64 * MAX_BLOCKS {
                out.reject(DecodeError::invalid(
                    "module_size",
                    format!("{} bytes in blocks of {}", m.size, block_size),
                ));
                continue;
            }
            let block_count = (m.size + block_size - 1) / block_size;
            debug!(
                "download {:#x}: module {} version {}, {} bytes in {} blocks, {} taps",
                download_id,
                m.module_id,
                m.version,
                m.size,
                block_count,
                m.taps.len()
            );
            self.modules.insert(
                m.module_id,
                ModuleState {
                    version: m.version,
                    size: m.size,
                    block_size,
                    blocks: FixedBitSet::with_capacity(block_count),
                    data: vec![0; m.size],
                    complete: m.size == 0,
                },
            );
        }
        Ok(())
    }

    fn ddb(&mut self, payload: &[u8], index: usize, out: &mut Decoded) -> Result<(), DecodeError> {
        let mut c = Cursor::at(payload, index);
        let module_id = c.u16("module_id")?;
        let version = c.u8("module_version")?;
        c.skip("reserved", 1)?;
        let block_number = usize::from(c.u16("block_number")?);
        let data = c.rest();
        let module = match self.modules.get_mut(&module_id) {
            Some(m) if m.version == version && !m.complete => m,
            _ => {
                trace!(
                    "ignoring block {} of module {} version {}",
                    block_number,
                    module_id,
                    version
                );
                return Ok(());
            }
        };
        if block_number >= module.blocks.len() {
            return Err(DecodeError::invalid(
                "block_number",
                format!(
                    "block {} of module {} which has {}",
                    block_number,
                    module_id,
                    module.blocks.len()
                ),
            ));
        }
        let offset = block_number * module.block_size;
        let expected = module.block_size.min(module.size - offset);
        if data.len() < expected {
            return Err(DecodeError::Truncated {
                field: "block_data",
                needed: expected,
                available: data.len(),
            });
        }
        if module.blocks.contains(block_number) {
            return Ok(());
        }
        module.data[offset..offset + expected].copy_from_slice(&data[..expected]);
        module.blocks.insert(block_number);
        if module.blocks.count_ones(..) == module.blocks.len() {
            module.complete = true;
            let data = std::mem::take(&mut module.data);
            debug!("module {} complete, {} bytes", module_id, data.len());
            objects(module_id, &data, out);
        }
        Ok(())
    }
}

/// Decode the BIOP messages making up a complete module.
fn objects(module_id: u16, data: &[u8], out: &mut Decoded) {
    let mut index = 0;
    while index < data.len() {
        match BiopMessage::decode(data, index) {
            Ok((msg, next)) => {
                out.accept(Record::CarouselObject(CarouselObjectRecord {
                    module_id,
                    object_key: msg.object_key,
                    kind: msg.kind,
                    content: msg.content,
                }));
                index = next;
            }
            Err(e) => {
                warn!("module {}: bad BIOP message at {}: {}", module_id, index, e);
                out.reject(e);
                break;
            }
        }
    }
}

impl TableDecoder for CarouselDecoder {
    fn name(&self) -> &'static str {
        "object-carousel"
    }

    fn table_ids(&self) -> TableFilter {
        TableFilter::only(&[DSI_DII_TABLE_ID, DDB_TABLE_ID])
    }

    fn decode(
        &mut self,
        _ctx: &mut ProtocolContext,
        section: &RawSection,
    ) -> Result<Decoded, DecodeError> {
        expect_table(self, section)?;
        let payload = &section.payload[..];
        let (header, index) = MessageHeader::decode(payload, 0)?;
        trace!(
            "message {:#06x} transaction {:#x}",
            header.message_id,
            header.transaction_id
        );
        let mut out = Decoded::default();
        match (section.table_id, header.message_id) {
            (DSI_DII_TABLE_ID, DSI_MESSAGE) => self.dsi(payload, index)?,
            (DSI_DII_TABLE_ID, DII_MESSAGE) => self.dii(payload, index, &mut out)?,
            (DDB_TABLE_ID, DDB_MESSAGE) => self.ddb(payload, index, &mut out)?,
            (_, id) => {
                return Err(DecodeError::invalid(
                    "message_id",
                    format!("unexpected {:#06x}", id),
                ))
            }
        }
        Ok(out)
    }

    fn counted_kind(&self) -> RecordKind {
        RecordKind::CarouselObject
    }

    fn is_complete(&self) -> bool {
        self.announced && self.modules.values().all(|m| m.complete)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decode::make_test_data;
    use crate::packet::Pid;
    use assert_matches::assert_matches;
    use bitstream_io::BitWrite;

    const CAROUSEL_PID: Pid = Pid::new(0x1f40);

    fn ior(type_id: &[u8], module_id: u16, key: u8) -> Vec<u8> {
        make_test_data(|w| {
            w.write(32, type_id.len() as u32)?;
            w.write_bytes(type_id)?;
            w.write(32, 1u32)?; // tagged_profiles_count
            w.write(32, BIOP_PROFILE_TAG)?;
            w.write(32, 40u32)?;
            w.write(8, 0)?; // byte_order
            w.write(8, 2)?; // lite_component_count
            w.write(32, OBJECT_LOCATION_TAG)?;
            w.write(8, 10)?;
            w.write(32, 1u32)?; // carousel_id
            w.write(16, module_id)?;
            w.write(8, 1)?;
            w.write(8, 0)?;
            w.write(8, 1)?;
            w.write(8, key)?;
            w.write(32, CONN_BINDER_TAG)?;
            w.write(8, 18)?;
            w.write(8, 1)?; // taps_count
            w.write(16, 0)?;
            w.write(16, 0x0016)?; // BIOP_DELIVERY_PARA_USE
            w.write(16, 0x000b)?;
            w.write(8, 10)?;
            w.write(16, 1)?; // selector_type
            w.write(32, 0x8000_0002u32)?; // transaction_id
            w.write(32, 0xffff_ffffu32) // timeout
        })
    }

    fn message(kind: &[u8], key: u8, body: &[u8]) -> Vec<u8> {
        let mut rest = vec![1, key];
        rest.extend_from_slice(&(kind.len() as u32).to_be_bytes());
        rest.extend_from_slice(kind);
        rest.extend_from_slice(&[0, 0]); // object_info_length
        rest.push(0); // service_context_list_count
        rest.extend_from_slice(&(body.len() as u32).to_be_bytes());
        rest.extend_from_slice(body);
        let mut msg = b"BIOP\x01\x00\x00\x00".to_vec();
        msg.extend_from_slice(&(rest.len() as u32).to_be_bytes());
        msg.extend(rest);
        msg
    }

    fn file_message(key: u8, content: &[u8]) -> Vec<u8> {
        let mut body = (content.len() as u32).to_be_bytes().to_vec();
        body.extend_from_slice(content);
        message(b"fil\0", key, &body)
    }

    fn gateway_message() -> Vec<u8> {
        let mut body = vec![0, 1]; // bindings_count
        body.push(1); // name_components_count
        body.push(6);
        body.extend_from_slice(b"hello\0");
        body.push(4);
        body.extend_from_slice(b"fil\0");
        body.push(0x01); // binding_type
        body.extend(ior(b"fil\0", 1, 2));
        body.extend_from_slice(&[0, 0]);
        message(b"srg\0", 1, &body)
    }

    fn header(message_id: u16, rest: &[u8]) -> Vec<u8> {
        let mut out = vec![PROTOCOL_DISCRIMINATOR, DSMCC_TYPE_DOWNLOAD];
        out.extend_from_slice(&message_id.to_be_bytes());
        out.extend_from_slice(&0x8000_0002u32.to_be_bytes());
        out.push(0xff);
        out.push(0);
        out.extend_from_slice(&(rest.len() as u16).to_be_bytes());
        out.extend_from_slice(rest);
        out
    }

    fn dii(block_size: u16, module_size: u32, compressed: bool) -> RawSection {
        let user_info: &[u8] = if compressed {
            &[COMPRESSED_MODULE_TAG, 5, 0x08, 0, 0, 0x10, 0]
        } else {
            &[]
        };
        let body = make_test_data(|w| {
            w.write(32, 1u32)?; // download_id
            w.write(16, block_size)?;
            w.write_bytes(&[0; 10])?;
            w.write(16, 0)?; // compatibility_descriptor_length
            w.write(16, 1)?; // number_of_modules
            w.write(16, 1)?; // module_id
            w.write(32, module_size)?;
            w.write(8, 1)?; // module_version
            w.write(8, (12 + 1 + 7 + 1 + user_info.len()) as u8)?;
            w.write_bytes(&[0; 12])?;
            w.write(8, 1)?;
            w.write(16, 0)?;
            w.write(16, 0x0017)?; // BIOP_OBJECT_USE
            w.write(16, 0x000b)?;
            w.write(8, 0)?;
            w.write(8, user_info.len() as u8)?;
            w.write_bytes(user_info)?;
            w.write(16, 0) // private_data_length
        });
        RawSection::long(CAROUSEL_PID, DSI_DII_TABLE_ID, 2, 0, 0, 0, &header(DII_MESSAGE, &body))
    }

    fn ddb(block_number: u16, data: &[u8]) -> RawSection {
        let mut body = vec![0, 1, 1, 0xff];
        body.extend_from_slice(&block_number.to_be_bytes());
        body.extend_from_slice(data);
        RawSection::long(
            CAROUSEL_PID,
            DDB_TABLE_ID,
            1,
            0,
            block_number as u8,
            1,
            &header(DDB_MESSAGE, &body),
        )
    }

    #[test]
    fn ior_location_and_taps() {
        let data = ior(b"dir\0", 7, 3);
        let (ior, next) = Ior::decode(&data, 0).unwrap();
        assert_eq!(next, data.len());
        assert_eq!(ior.type_id, ObjectKind::Directory);
        assert_eq!(
            ior.location(),
            Some(&ObjectLocation {
                carousel_id: 1,
                module_id: 7,
                version: (1, 0),
                object_key: vec![3],
            })
        );
        let taps: Vec<_> = ior.taps().collect();
        assert_eq!(taps.len(), 1);
        assert_eq!(taps[0].tap_use, 0x0016);
        assert_eq!(taps[0].selector.len(), 10);
    }

    #[test]
    fn truncated_lite_component() {
        let mut data = ior(b"dir\0", 7, 3);
        data.truncate(data.len() - 5);
        assert_matches!(Ior::decode(&data, 0), Err(DecodeError::Truncated { .. }));
    }

    #[test]
    fn module_reassembly() {
        let mut module = file_message(2, b"<html/>");
        module.extend(gateway_message());
        let block_size = (module.len() + 1) / 2;
        let mut dec = CarouselDecoder::new();
        let mut ctx = ProtocolContext::default();

        // blocks before the DII can't be placed
        let early = dec.decode(&mut ctx, &ddb(0, &module[..block_size])).unwrap();
        assert!(early.is_empty());
        assert!(!dec.is_complete());

        let out = dec
            .decode(&mut ctx, &dii(block_size as u16, module.len() as u32, false))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(dec.progress(), (0, 1));

        let out = dec.decode(&mut ctx, &ddb(1, &module[block_size..])).unwrap();
        assert!(out.is_empty());
        assert!(!dec.is_complete());

        let out = dec.decode(&mut ctx, &ddb(0, &module[..block_size])).unwrap();
        assert!(out.rejected.is_empty(), "{:?}", out.rejected);
        assert!(dec.is_complete());
        assert_matches!(&out.records[..], [Record::CarouselObject(file), Record::CarouselObject(srg)] => {
            assert_eq!(file.module_id, 1);
            assert_eq!(file.object_key, vec![2]);
            assert_eq!(file.kind, ObjectKind::File);
            assert_eq!(file.content, CarouselContent::File(b"<html/>".to_vec()));
            assert_eq!(srg.kind, ObjectKind::ServiceGateway);
            assert_matches!(&srg.content, CarouselContent::Directory(bindings) => {
                assert_eq!(bindings.len(), 1);
                assert_eq!(bindings[0].path(), "hello");
                assert_eq!(bindings[0].binding_type, BindingType::Object);
                assert_eq!(bindings[0].name[0].kind, ObjectKind::File);
                assert_eq!(bindings[0].ior.location().unwrap().object_key, vec![2]);
            });
        });

        // repeats of a complete module produce nothing more
        let again = dec.decode(&mut ctx, &ddb(0, &module[..block_size])).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn compressed_module_rejected() {
        let mut dec = CarouselDecoder::new();
        let mut ctx = ProtocolContext::default();
        let out = dec.decode(&mut ctx, &dii(4066, 100, true)).unwrap();
        assert_matches!(
            &out.rejected[..],
            [DecodeError::InvalidField {
                field: "compressed_module",
                ..
            }]
        );
        // only reported the first time
        assert!(dec.decode(&mut ctx, &dii(4066, 100, true)).unwrap().is_empty());
        assert!(dec.is_complete());
    }

    #[test]
    fn oversized_module_rejected() {
        let mut dec = CarouselDecoder::new();
        let mut ctx = ProtocolContext::default();
        let out = dec.decode(&mut ctx, &dii(4066, 0xffff_ffff, false)).unwrap();
        assert_matches!(
            &out.rejected[..],
            [DecodeError::InvalidField {
                field: "module_size",
                ..
            }]
        );
        assert_eq!(dec.progress(), (0, 0));

        // more blocks than a 16 bit block_number can address
        let out = dec.decode(&mut ctx, &dii(8, 8 * 65536 + 1, false)).unwrap();
        assert_matches!(
            &out.rejected[..],
            [DecodeError::InvalidField {
                field: "module_size",
                ..
            }]
        );
        assert_eq!(dec.progress(), (0, 0));
    }

    #[test]
    fn short_block() {
        let mut dec = CarouselDecoder::new();
        let mut ctx = ProtocolContext::default();
        dec.decode(&mut ctx, &dii(8, 16, false)).unwrap();
        assert_matches!(
            dec.decode(&mut ctx, &ddb(0, b"abc")),
            Err(DecodeError::Truncated {
                field: "block_data",
                needed: 8,
                available: 3
            })
        );
        assert_matches!(
            dec.decode(&mut ctx, &ddb(2, b"abcdefgh")),
            Err(DecodeError::InvalidField {
                field: "block_number",
                ..
            })
        );
    }

    #[test]
    fn service_gateway_from_dsi() {
        let mut body = vec![0xff; 20];
        body.extend_from_slice(&[0, 0]);
        let gateway = ior(b"srg\0", 1, 1);
        body.extend_from_slice(&(gateway.len() as u16).to_be_bytes());
        body.extend(gateway);
        let raw = RawSection::long(
            CAROUSEL_PID,
            DSI_DII_TABLE_ID,
            0,
            0,
            0,
            0,
            &header(DSI_MESSAGE, &body),
        );
        let mut dec = CarouselDecoder::new();
        assert!(dec.decode(&mut ProtocolContext::default(), &raw).unwrap().is_empty());
        assert_eq!(dec.service_gateway().map(|l| l.module_id), Some(1));
        // no DII yet
        assert!(!dec.is_complete());
    }

    #[test]
    fn wrong_message() {
        let raw = RawSection::long(
            CAROUSEL_PID,
            DDB_TABLE_ID,
            0,
            0,
            0,
            0,
            &header(DII_MESSAGE, &[]),
        );
        assert_matches!(
            CarouselDecoder::new().decode(&mut ProtocolContext::default(), &raw),
            Err(DecodeError::InvalidField {
                field: "message_id",
                ..
            })
        );
    }
}
