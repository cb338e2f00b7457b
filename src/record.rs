//! The normalised records that every protocol decoder produces.

use crate::decode::biop::{Binding, ObjectKind};
use crate::decode::DecodeError;
use crate::packet::Pid;
use chrono::{DateTime, Utc};
use std::fmt;

/// Identity of a broadcast service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceIdentity {
    pub original_network_id: u16,
    pub transport_stream_id: u16,
    pub service_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Television,
    Radio,
    Data,
    Other(u8),
}

impl ChannelType {
    /// From a DVB `service_type` value.
    pub fn from_dvb(service_type: u8) -> ChannelType {
        match service_type {
            0x01 | 0x11 | 0x16 | 0x19 | 0x1f => ChannelType::Television,
            0x02 | 0x0a => ChannelType::Radio,
            0x0c => ChannelType::Data,
            _ => ChannelType::Other(service_type),
        }
    }

    /// From an ATSC virtual channel `service_type` value.
    pub fn from_atsc(service_type: u8) -> ChannelType {
        match service_type {
            0x01 | 0x02 => ChannelType::Television,
            0x03 => ChannelType::Radio,
            0x04 => ChannelType::Data,
            _ => ChannelType::Other(service_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    /// The protocol's own channel number, which titles refer to.
    pub channel_id: u32,
    pub original_network_id: u16,
    pub transport_stream_id: u16,
    pub service_id: u16,
    pub name: String,
    pub channel_type: ChannelType,
    pub user_channel_number: Option<u32>,
}

impl ChannelRecord {
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            original_network_id: self.original_network_id,
            transport_stream_id: self.transport_stream_id,
            service_id: self.service_id,
        }
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.channel_id == 0 {
            return Err(DecodeError::invalid("channel_id", "zero"));
        }
        if self.name.chars().any(|c| c.is_control() && c != '\n') {
            return Err(DecodeError::invalid(
                "name",
                format!("control characters in {:?}", self.name),
            ));
        }
        Ok(())
    }
}

/// A category code, which is a single number in some protocols and a (category, sub-category)
/// pair in others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CategoryCode {
    Single(u16),
    Pair(u8, u8),
}

impl fmt::Display for CategoryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryCode::Single(v) => write!(f, "{}", v),
            CategoryCode::Pair(c, s) => write!(f, "{},{}", c, s),
        }
    }
}

/// Series information carried by content identifier descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeasonMeta {
    pub series_crid: Option<String>,
    pub episode_crid: Option<String>,
}

/// The longest duration any sane guide entry has.
const MAX_DURATION_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleRecord {
    pub channel_id: u32,
    pub category: Option<CategoryCode>,
    pub event_id: u32,
    pub event_name: String,
    pub start_time: DateTime<Utc>,
    pub duration: chrono::Duration,
    pub summary_available: bool,
    pub season: Option<SeasonMeta>,
}

impl TitleRecord {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + self.duration
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.channel_id == 0 {
            return Err(DecodeError::invalid("channel_id", "zero"));
        }
        if self.duration < chrono::Duration::zero()
            || self.duration > chrono::Duration::days(MAX_DURATION_DAYS)
        {
            return Err(DecodeError::invalid(
                "duration",
                format!("{} seconds", self.duration.num_seconds()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRecord {
    pub event_id: u32,
    pub short_description: String,
    pub extended_description: Option<String>,
    /// Protocol specific flag bits (MediaHighway replay count, Dish dictionary selector).
    pub flags: u8,
}

impl SummaryRecord {
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.short_description.trim().is_empty() && self.extended_description.is_none() {
            return Err(DecodeError::invalid("short_description", "empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRecord {
    pub code: CategoryCode,
    pub description: String,
    pub sample_event: Option<String>,
    pub used_count: u32,
}

impl CategoryRecord {
    pub fn new(code: CategoryCode, description: impl Into<String>) -> CategoryRecord {
        CategoryRecord {
            code,
            description: description.into(),
            sample_event: None,
            used_count: 0,
        }
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.description.trim().is_empty() {
            return Err(DecodeError::invalid(
                "description",
                format!("empty description for category {}", self.code),
            ));
        }
        Ok(())
    }
}

/// A PAT entry.  Program number zero gives the network PID instead of a PMT PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramRecord {
    pub transport_stream_id: u16,
    pub program_number: u16,
    pub pid: Pid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceEntry {
    pub service_id: u16,
    pub service_type: u8,
}

/// A transport stream as listed by the NIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRecord {
    pub network_id: u16,
    pub original_network_id: u16,
    pub transport_stream_id: u16,
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalChannelRecord {
    pub service: ServiceIdentity,
    pub logical_channel_number: u16,
    pub visible: bool,
}

/// A service name learned separately from the channel list that refers to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNameRecord {
    pub service: ServiceIdentity,
    pub name: String,
    pub channel_type: ChannelType,
}

/// An ATSC MGT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuideTableRecord {
    pub table_type: u16,
    pub pid: Pid,
    pub version: u8,
    pub number_bytes: u32,
}

impl GuideTableRecord {
    /// For an EIT-k table, `k`.
    pub fn eit_index(&self) -> Option<u8> {
        match self.table_type {
            0x0100..=0x017f => Some((self.table_type - 0x0100) as u8),
            _ => None,
        }
    }

    /// For an event ETT-k table, `k`.
    pub fn ett_index(&self) -> Option<u8> {
        match self.table_type {
            0x0200..=0x027f => Some((self.table_type - 0x0200) as u8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarouselContent {
    File(Vec<u8>),
    Directory(Vec<Binding>),
    /// Stream and stream-event objects, whose bodies are kept undecoded.
    Other(Vec<u8>),
}

/// An object extracted from a DSM-CC object carousel module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarouselObjectRecord {
    pub module_id: u16,
    pub object_key: Vec<u8>,
    pub kind: ObjectKind,
    pub content: CarouselContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Channel,
    Title,
    Summary,
    Category,
    Program,
    Transport,
    LogicalChannel,
    ServiceName,
    GuideTable,
    CarouselObject,
}

impl RecordKind {
    pub const ALL: [RecordKind; 10] = [
        RecordKind::Channel,
        RecordKind::Title,
        RecordKind::Summary,
        RecordKind::Category,
        RecordKind::Program,
        RecordKind::Transport,
        RecordKind::LogicalChannel,
        RecordKind::ServiceName,
        RecordKind::GuideTable,
        RecordKind::CarouselObject,
    ];
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Channel => "channels",
            RecordKind::Title => "titles",
            RecordKind::Summary => "summaries",
            RecordKind::Category => "categories",
            RecordKind::Program => "programs",
            RecordKind::Transport => "transports",
            RecordKind::LogicalChannel => "logical channels",
            RecordKind::ServiceName => "service names",
            RecordKind::GuideTable => "guide tables",
            RecordKind::CarouselObject => "carousel objects",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Channel(ChannelRecord),
    Title(TitleRecord),
    Summary(SummaryRecord),
    Category(CategoryRecord),
    Program(ProgramRecord),
    Transport(TransportRecord),
    LogicalChannel(LogicalChannelRecord),
    ServiceName(ServiceNameRecord),
    GuideTable(GuideTableRecord),
    CarouselObject(CarouselObjectRecord),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Channel(_) => RecordKind::Channel,
            Record::Title(_) => RecordKind::Title,
            Record::Summary(_) => RecordKind::Summary,
            Record::Category(_) => RecordKind::Category,
            Record::Program(_) => RecordKind::Program,
            Record::Transport(_) => RecordKind::Transport,
            Record::LogicalChannel(_) => RecordKind::LogicalChannel,
            Record::ServiceName(_) => RecordKind::ServiceName,
            Record::GuideTable(_) => RecordKind::GuideTable,
            Record::CarouselObject(_) => RecordKind::CarouselObject,
        }
    }

    /// Check the decoded values make sense before the record is linked to anything else.
    pub fn validate(&self) -> Result<(), DecodeError> {
        match self {
            Record::Channel(c) => c.validate(),
            Record::Title(t) => t.validate(),
            Record::Summary(s) => s.validate(),
            Record::Category(c) => c.validate(),
            Record::LogicalChannel(l) if l.logical_channel_number == 0 => Err(
                DecodeError::invalid("logical_channel_number", "zero"),
            ),
            _ => Ok(()),
        }
    }
}
